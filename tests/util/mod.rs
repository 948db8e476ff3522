
pub mod cmd;
pub mod fake_tool;
pub mod job_dir;
