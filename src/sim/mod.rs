pub mod jobs;
pub mod kernel;
pub mod machines;
pub mod planner;
pub mod predictor;
pub mod queues;
