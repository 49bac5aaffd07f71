//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。错误按类别构成封闭和类型，
//! 弹性层据此区分可重试错误与校验错误。

use thiserror::Error;

/// 校验错误码
///
/// 稳定数字编码，嵌入方可以直接依赖这些值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u16)]
pub enum ValidationCode {
    /// 缺少桶类型
    MissingType = 101,
    /// 未知的桶类型
    UnknownType = 102,
    /// 缺少键
    MissingKey = 103,
    /// 非法键
    InvalidKey = 104,
    /// 非法的调用级配置覆盖
    InvalidOverride = 105,
    /// 非法的令牌数量
    InvalidCount = 106,
}

impl ValidationCode {
    /// 获取数字错误码
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// Bucketron 错误类型
#[derive(Error, Debug, Clone)]
pub enum BucketronError {
    /// 配置错误（构造时的致命错误）
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 校验错误（参数非法，不重试，不计入熔断）
    #[error("校验错误[{}]: {message}", .code.code())]
    ValidationError {
        /// 错误码
        code: ValidationCode,
        /// 错误描述
        message: String,
    },

    /// 传输错误（连接失败、节点错误、命令超时，可重试）
    #[error("传输错误: {0}")]
    TransportError(String),

    /// 命令超时
    #[error("命令超时: {0}ms内未完成")]
    CommandTimeout(u64),

    /// 熔断器打开（立即失败，不重试，不计入熔断）
    #[error("熔断器打开，请求被拒绝")]
    BreakerOpen,

    /// 存储脚本返回的错误（按传输错误处理重试）
    #[error("存储错误: {0}")]
    StoreError(String),

    /// 客户端已关闭
    #[error("客户端已关闭")]
    AlreadyClosed,
}

impl BucketronError {
    /// 构造校验错误
    pub fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        BucketronError::ValidationError {
            code,
            message: message.into(),
        }
    }

    /// 是否为校验错误
    pub fn is_validation(&self) -> bool {
        matches!(self, BucketronError::ValidationError { .. })
    }

    /// 是否可重试
    ///
    /// 传输类错误（含命令超时与存储错误）可重试；
    /// 校验错误、熔断器打开和配置错误不可重试。
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BucketronError::TransportError(_)
                | BucketronError::CommandTimeout(_)
                | BucketronError::StoreError(_)
        )
    }

    /// 是否计入熔断器失败
    ///
    /// 校验错误永远不计入，熔断器打开本身也不计入。
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_retriable()
    }
}

impl From<redis::RedisError> for BucketronError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return BucketronError::TransportError(format!("IO超时: {}", err));
        }
        match err.kind() {
            redis::ErrorKind::IoError => {
                BucketronError::TransportError(format!("连接错误: {}", err))
            }
            redis::ErrorKind::AuthenticationFailed => {
                BucketronError::TransportError(format!("认证失败: {}", err))
            }
            redis::ErrorKind::ResponseError => BucketronError::StoreError(err.to_string()),
            _ => BucketronError::TransportError(err.to_string()),
        }
    }
}
