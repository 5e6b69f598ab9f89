//! 远程仓库接口（Hugging Face Hub tree / resolve）。

pub mod network;
