pub mod storage;
pub mod normalizer;
pub mod model_runtime;
pub mod task_store;
pub mod prediction;
pub mod scheduler;
