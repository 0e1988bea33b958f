use std::{any::Any, fmt, hash::Hash, hash::Hasher};

use crate::{error::Result, transceiver::Transceiver};

/// 一个已解析、可直接建连的目标。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端点解析出 N 个地址就生成 N 个连接器；连接池以连接器为键去重，避免向同一地址重复建连。
///
/// ## 契约（What）
/// - 相等性只看 `(timeout, connection_id, 解析后地址)`，主机名仅用于展示；
/// - `connect` 只创建处于 `NeedConnect` 状态的收发器，不做任何 I/O，
///   真正的建连由就绪循环反复调用 [`Transceiver::initialize`] 推进。
pub trait Connector: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// 传输种类判别值。
    fn kind(&self) -> i16;

    /// 创建出站收发器。
    fn connect(&self) -> Result<Box<dyn Transceiver>>;

    /// 构造时缓存的确定性哈希。
    fn hash_code(&self) -> i32;

    /// 与另一个连接器是否指向同一目标。
    fn equals(&self, other: &dyn Connector) -> bool;

    fn as_any(&self) -> &dyn Any;
}

impl PartialEq for dyn Connector {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.equals(other)
    }
}

impl Eq for dyn Connector {}

impl Hash for dyn Connector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash_code());
    }
}
