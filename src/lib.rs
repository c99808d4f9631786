// 视频参数集解析 + 基于垂直同步的呈现调度

pub mod core;
pub mod parser;
pub mod renderer;
