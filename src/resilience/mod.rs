//! 韧性层：下游依赖的熔断保护

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerOverride, CircuitBreakerState, CircuitState,
};
