//! 任务依赖解析
//!
//! 纯内存逻辑、无共享状态：依赖校验（深度 / 环 / 缺失）、DFS 后序拓扑排序、
//! 按执行方式分组、就绪任务筛选、优先级与统计。

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use super::types::AgentTask;
use crate::core::OrchestratorError;

pub const MAX_TASK_DEPTH: usize = 5;

/// 分组结果：parallel 中每组可并发（按优先级降序），sequential 已按依赖排好
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub parallel: Vec<Vec<AgentTask>>,
    pub sequential: Vec<AgentTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total_tasks: usize,
    pub independent_tasks: usize,
    pub dependent_tasks: usize,
    pub max_depth: usize,
    pub avg_dependencies: f64,
}

/// 依次检查：深度上限、依赖环、依赖缺失
pub fn validate_task_dependencies(
    task: &AgentTask,
    all_tasks: &HashMap<String, AgentTask>,
) -> Result<(), OrchestratorError> {
    if task.metadata.depth > MAX_TASK_DEPTH {
        let chain = if task.metadata.call_chain.is_empty() {
            "unknown".to_string()
        } else {
            task.metadata.call_chain.join(" → ")
        };
        return Err(OrchestratorError::MaxDepthExceeded {
            max: MAX_TASK_DEPTH,
            chain,
        });
    }

    let mut path = Vec::new();
    let mut acyclic = HashSet::new();
    detect_cycle(task, all_tasks, &mut path, &mut acyclic)?;

    if let Some(missing) = task
        .dependencies
        .iter()
        .find(|d| !all_tasks.contains_key(d.as_str()))
    {
        return Err(OrchestratorError::MissingDependency {
            task: task.id.clone(),
            dependency: missing.clone(),
        });
    }
    Ok(())
}

/// path 为当前 DFS 栈；acyclic 记录已确认无环的节点，菱形依赖不会重复展开
fn detect_cycle<'a>(
    task: &'a AgentTask,
    all_tasks: &'a HashMap<String, AgentTask>,
    path: &mut Vec<&'a str>,
    acyclic: &mut HashSet<&'a str>,
) -> Result<(), OrchestratorError> {
    path.push(&task.id);
    for dep in &task.dependencies {
        if path.contains(&dep.as_str()) {
            let mut cycle: Vec<&str> = path.clone();
            cycle.push(dep);
            return Err(OrchestratorError::CircularDependency {
                path: cycle.join(" → "),
            });
        }
        if acyclic.contains(dep.as_str()) {
            continue;
        }
        if let Some(dep_task) = all_tasks.get(dep) {
            detect_cycle(dep_task, all_tasks, path, acyclic)?;
        }
    }
    path.pop();
    acyclic.insert(&task.id);
    Ok(())
}

/// DFS 后序拓扑排序：依赖先于依赖方，无关任务保持输入顺序
pub fn build_execution_order(tasks: &[AgentTask]) -> Vec<AgentTask> {
    let by_id: HashMap<&str, &AgentTask> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(tasks.len());

    fn visit<'a>(
        task: &'a AgentTask,
        by_id: &HashMap<&str, &'a AgentTask>,
        visited: &mut HashSet<&'a str>,
        order: &mut Vec<AgentTask>,
    ) {
        if !visited.insert(task.id.as_str()) {
            return;
        }
        for dep in &task.dependencies {
            if let Some(&dep_task) = by_id.get(dep.as_str()) {
                visit(dep_task, by_id, visited, order);
            }
        }
        order.push(task.clone());
    }

    for task in tasks {
        visit(task, &by_id, &mut visited, &mut order);
    }
    order
}

pub fn group_tasks_by_execution_mode(tasks: &[AgentTask]) -> ExecutionPlan {
    let (independent, dependent): (Vec<AgentTask>, Vec<AgentTask>) = tasks
        .iter()
        .cloned()
        .partition(|t| t.dependencies.is_empty());

    let mut by_priority: BTreeMap<i64, Vec<AgentTask>> = BTreeMap::new();
    for task in independent {
        by_priority.entry(task.priority).or_default().push(task);
    }

    ExecutionPlan {
        parallel: by_priority.into_values().rev().collect(),
        sequential: build_execution_order(&dependent),
    }
}

/// 未完成且所有依赖都已完成的任务
pub fn find_ready_tasks(tasks: &[AgentTask], completed: &HashSet<String>) -> Vec<AgentTask> {
    tasks
        .iter()
        .filter(|t| !completed.contains(&t.id))
        .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
        .cloned()
        .collect()
}

/// 每个依赖 -0.1，每个被依赖 +0.2
pub fn calculate_task_priority(task: &AgentTask, all_tasks: &HashMap<String, AgentTask>) -> f64 {
    let dependents = all_tasks
        .values()
        .filter(|t| t.dependencies.contains(&task.id))
        .count();
    task.priority as f64 - task.dependencies.len() as f64 * 0.1 + dependents as f64 * 0.2
}

pub fn task_stats(tasks: &[AgentTask]) -> TaskStats {
    let dependent = tasks.iter().filter(|t| !t.dependencies.is_empty()).count();
    let total_deps: usize = tasks.iter().map(|t| t.dependencies.len()).sum();
    TaskStats {
        total_tasks: tasks.len(),
        independent_tasks: tasks.len() - dependent,
        dependent_tasks: dependent,
        max_depth: tasks.iter().map(|t| t.metadata.depth).max().unwrap_or(0),
        avg_dependencies: if tasks.is_empty() {
            0.0
        } else {
            total_deps as f64 / tasks.len() as f64
        },
    }
}

/// 单个结果原样返回；全是数组则拍平；全是对象则浅合并（后者覆盖前者）；否则组成数组
pub fn merge_task_results(results: Vec<Value>) -> Value {
    if results.len() == 1 {
        return results.into_iter().next().unwrap_or(Value::Null);
    }
    if results.iter().all(Value::is_array) {
        return Value::Array(
            results
                .into_iter()
                .flat_map(|r| match r {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                })
                .collect(),
        );
    }
    if results.iter().all(Value::is_object) {
        let mut merged = serde_json::Map::new();
        for r in results {
            if let Value::Object(map) = r {
                merged.extend(map);
            }
        }
        return Value::Object(merged);
    }
    Value::Array(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::TaskContext;
    use crate::intent::Intent;
    use serde_json::json;

    fn task(id: &str, deps: &[&str]) -> AgentTask {
        AgentTask::new("T", Intent::GeneralChat, TaskContext::default())
            .with_id(id)
            .with_dependencies(deps)
    }

    fn graph(tasks: &[AgentTask]) -> HashMap<String, AgentTask> {
        tasks.iter().map(|t| (t.id.clone(), t.clone())).collect()
    }

    fn ids(tasks: &[AgentTask]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_two_node_cycle_detected() {
        let tasks = [task("t1", &["t2"]), task("t2", &["t1"])];
        let err = validate_task_dependencies(&tasks[0], &graph(&tasks)).unwrap_err();
        match err {
            OrchestratorError::CircularDependency { path } => assert_eq!(path, "t1 → t2 → t1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let tasks = [
            task("a", &["b", "c"]),
            task("b", &["d"]),
            task("c", &["d"]),
            task("d", &[]),
        ];
        assert!(validate_task_dependencies(&tasks[0], &graph(&tasks)).is_ok());
    }

    #[test]
    fn test_missing_dependency() {
        let tasks = [task("a", &["ghost"])];
        assert!(matches!(
            validate_task_dependencies(&tasks[0], &graph(&tasks)),
            Err(OrchestratorError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_depth_checked_first() {
        let mut deep = task("a", &["a"]);
        deep.metadata.depth = 6;
        deep.metadata.call_chain = vec!["LeaderAgent".into(), "ProductBrowsingAgent".into()];
        let err = validate_task_dependencies(&deep, &graph(&[deep.clone()])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Max task depth (5) exceeded. Call chain: LeaderAgent → ProductBrowsingAgent"
        );
    }

    #[test]
    fn test_execution_order_dependencies_first_and_stable() {
        let tasks = [
            task("c", &["b"]),
            task("x", &[]),
            task("b", &["a"]),
            task("a", &[]),
            task("y", &[]),
        ];
        assert_eq!(ids(&build_execution_order(&tasks)), vec!["a", "b", "c", "x", "y"]);
    }

    #[test]
    fn test_grouping_by_priority() {
        let tasks = [
            task("low", &[]).with_priority(1),
            task("high1", &[]).with_priority(5),
            task("dep", &["high1"]),
            task("high2", &[]).with_priority(5),
        ];
        let plan = group_tasks_by_execution_mode(&tasks);
        assert_eq!(plan.parallel.len(), 2);
        assert_eq!(ids(&plan.parallel[0]), vec!["high1", "high2"]);
        assert_eq!(ids(&plan.parallel[1]), vec!["low"]);
        assert_eq!(ids(&plan.sequential), vec!["dep"]);
    }

    #[test]
    fn test_ready_tasks_skip_completed() {
        let tasks = [task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])];
        let completed = HashSet::from(["a".to_string()]);
        assert_eq!(ids(&find_ready_tasks(&tasks, &completed)), vec!["b"]);
    }

    #[test]
    fn test_priority_and_stats() {
        let tasks = [task("a", &[]).with_priority(2), task("b", &["a"]), task("c", &["a"])];
        let all = graph(&tasks);
        assert!((calculate_task_priority(&tasks[0], &all) - 2.4).abs() < 1e-9);
        assert!((calculate_task_priority(&tasks[1], &all) - 0.9).abs() < 1e-9);

        let stats = task_stats(&tasks);
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.independent_tasks, 1);
        assert_eq!(stats.dependent_tasks, 2);
        assert!((stats.avg_dependencies - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_results() {
        assert_eq!(merge_task_results(vec![json!(1)]), json!(1));
        assert_eq!(
            merge_task_results(vec![json!([1]), json!([2, 3])]),
            json!([1, 2, 3])
        );
        assert_eq!(
            merge_task_results(vec![json!({"a": 1}), json!({"a": 2, "b": 3})]),
            json!({"a": 2, "b": 3})
        );
        assert_eq!(
            merge_task_results(vec![json!(1), json!("x")]),
            json!([1, "x"])
        );
    }
}
