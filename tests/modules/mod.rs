mod pipeline;
mod redis_cache;
