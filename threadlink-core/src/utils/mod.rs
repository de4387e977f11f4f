pub mod backoff;
pub mod lazy_redis;
