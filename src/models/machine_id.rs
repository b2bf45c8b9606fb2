//! 凭证机器码
//!
//! 为每个凭证生成稳定的 SHA256 机器码，嵌入出站 User-Agent，
//! 使上游反滥用侧把每个凭证视为独立客户端。

use sha2::{Digest, Sha256};

/// 生成凭证机器码
///
/// 取材优先级：凭证 uuid > profileArn > clientId。三者都缺失时
/// 使用零 UUID，保证函数总能返回 64 位十六进制串。
pub fn machine_id_for(
    uuid: Option<&str>,
    profile_arn: Option<&str>,
    client_id: Option<&str>,
) -> String {
    let seed = uuid
        .or(profile_arn)
        .or(client_id)
        .unwrap_or("00000000-0000-0000-0000-000000000000");

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let result = hasher.finalize();
    format!("{:x}", result)
}
