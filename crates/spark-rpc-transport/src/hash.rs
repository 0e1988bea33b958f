//! 确定性哈希累加工具。
//!
//! 端点与连接器的哈希值会缓存在对象内部并参与去重，因此必须跨进程、跨平台稳定，
//! 不能依赖 `std` 默认的随机化哈希器。算法为经典的 djb2 变体：
//! 初值 5381，每次累加 `h = ((h << 5) + h) ^ v`，全部运算按 `i32` 回绕。

use std::net::{IpAddr, SocketAddr};

/// 哈希初值。
pub const HASH_SEED: i32 = 5381;

/// 累加一个整数。
pub fn hash_add_i32(hash: i32, value: i32) -> i32 {
    hash.wrapping_shl(5).wrapping_add(hash) ^ value
}

/// 累加一个布尔值。
pub fn hash_add_bool(hash: i32, value: bool) -> i32 {
    hash_add_i32(hash, if value { 1 } else { 0 })
}

/// 累加一个字符串（逐字节）。
pub fn hash_add_str(hash: i32, value: &str) -> i32 {
    value
        .bytes()
        .fold(hash, |acc, byte| hash_add_i32(acc, i32::from(byte)))
}

/// 累加一个 IP 地址（逐字节）。
pub fn hash_add_ip(hash: i32, value: &IpAddr) -> i32 {
    match value {
        IpAddr::V4(v4) => v4
            .octets()
            .iter()
            .fold(hash, |acc, byte| hash_add_i32(acc, i32::from(*byte))),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .fold(hash, |acc, byte| hash_add_i32(acc, i32::from(*byte))),
    }
}

/// 累加一个套接字地址。
pub fn hash_add_socket_addr(hash: i32, value: &SocketAddr) -> i32 {
    hash_add_i32(hash_add_ip(hash, &value.ip()), i32::from(value.port()))
}
