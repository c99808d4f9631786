use thiserror::Error;

/// 码流解析错误（单次解析内有效，不跨调用传播状态）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("码流数据不足")]
    BufferExhausted,

    #[error("语法错误: {0}")]
    Malformed(&'static str),

    #[error("不支持的 profile: {0}")]
    UnsupportedProfile(u32),

    #[error("不支持的 level: {0}")]
    UnsupportedLevel(u32),

    #[error("{field} 超出范围: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("未找到: {0}")]
    MissingLandmark(&'static str),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// 呈现器错误
#[derive(Error, Debug)]
pub enum PresenterError {
    #[error("呈现器已关闭")]
    Shutdown,

    #[error("没有可用的空闲表面")]
    SampleAllocatorEmpty,

    #[error("不支持的播放速率，最接近的速率: {nearest}")]
    UnsupportedRate { nearest: f32 },

    #[error("不支持的操作: {0}")]
    NotImplemented(&'static str),

    #[error("后端错误: {0}")]
    Backend(String),

    #[error("配置错误: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("解析错误: {0}")]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, PresenterError>;
