pub mod chat_service;
pub mod rate_limiter;
pub mod turn_engine;
