use std::{
    any::Any,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    BoxFuture,
    acceptor::Acceptor,
    connector::Connector,
    error::Result,
    stream::OutputStream,
};

/// 端点解析出多个地址时的连接器排序策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EndpointSelectionType {
    /// 打乱顺序，分散负载。
    #[default]
    Random,
    /// 保持解析顺序。
    Ordered,
}

/// 连接器列表回调：无论成功或失败都恰好调用一次。
pub type ConnectorsCallback = Box<dyn FnOnce(Result<Vec<Arc<dyn Connector>>>) + Send + 'static>;

/// 传输端点的能力契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - RPC 核心以统一方式持有不同传输种类的端点：按判别值（`kind`）区分种类，
///   通过工厂注册表创建，不依赖继承层级；
/// - 端点是不可变值对象：修改超时、压缩或连接 ID 时返回新的端点，旧值保持不变，
///   因此可以放心地在连接池、代理对象之间共享 `Arc<dyn Endpoint>`。
///
/// ## 逻辑（How）
/// - `compare` 只在两端种类相同时比较具体字段；跨种类比较由 [`compare_endpoints`] 按判别值完成；
/// - 相等性、排序与哈希三者一致：`compare == Equal` ⇔ 相等 ⇒ `hash_code` 相同；
/// - `connectors` 返回 `'static` Future，可交给任意运行时执行；`connectors_blocking`
///   与 `connectors_with` 复用同一套解析逻辑。
///
/// ## 契约（What）
/// - `encode`：先写 `i16` 种类，再写带长度前缀的封装负载；
/// - `equivalent`：仅比较主机与端口，用于判断两个端点能否共享同一条连接；
/// - `expand`：通配主机展开为每个本地接口一个端点，否则返回自身；
/// - `acceptor`：创建尚未绑定的接收器，调用 [`Acceptor::listen`] 后才真正监听。
///
/// ## 风险与权衡（Trade-offs）
/// - `as_any` 用于同种类端点间的向下转型，代价是实现方需要提供样板代码；
/// - 回调形式在运行时上下文中派生后台任务；没有运行时则在调用线程上同步解析，
///   此时 `connectors_with` 会阻塞到解析完成。
pub trait Endpoint: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// 传输种类判别值。
    fn kind(&self) -> i16;

    /// 协议名，即文本形式的首个记号。
    fn protocol(&self) -> &str;

    /// 超时（毫秒），`-1` 表示无限。
    fn timeout(&self) -> i32;

    fn with_timeout(&self, timeout: i32) -> Arc<dyn Endpoint>;

    fn connection_id(&self) -> &str;

    fn with_connection_id(&self, connection_id: &str) -> Arc<dyn Endpoint>;

    fn compress(&self) -> bool;

    fn with_compress(&self, compress: bool) -> Arc<dyn Endpoint>;

    /// 是否为数据报传输。
    fn datagram(&self) -> bool;

    /// 是否为加密传输。
    fn secure(&self) -> bool;

    /// 写出线上编码。
    fn encode(&self, out: &mut OutputStream) -> Result<()>;

    /// 构造时缓存的确定性哈希。
    fn hash_code(&self) -> i32;

    /// 能否与 `other` 共享连接。
    fn equivalent(&self, other: &dyn Endpoint) -> bool;

    /// 同种类端点间的全序比较；种类不同时按判别值排序。
    fn compare(&self, other: &dyn Endpoint) -> Ordering;

    fn as_any(&self) -> &dyn Any;

    /// 展开通配主机。
    fn expand(&self) -> Result<Vec<Arc<dyn Endpoint>>>;

    /// 异步解析主机并生成连接器。
    fn connectors(
        &self,
        selection: EndpointSelectionType,
    ) -> BoxFuture<'static, Result<Vec<Arc<dyn Connector>>>>;

    /// 同步解析主机并生成连接器。
    fn connectors_blocking(
        &self,
        selection: EndpointSelectionType,
    ) -> Result<Vec<Arc<dyn Connector>>>;

    /// 回调形式：解析完成后调用一次 `callback`，成功与失败都经由它报告。
    ///
    /// 处于 Tokio 运行时中时在后台任务里解析；否则退回 [`Endpoint::connectors_blocking`]
    /// 并在返回前调用回调。
    fn connectors_with(&self, selection: EndpointSelectionType, callback: ConnectorsCallback) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let future = self.connectors(selection);
                handle.spawn(async move {
                    callback(future.await);
                });
            }
            Err(_) => callback(self.connectors_blocking(selection)),
        }
    }

    /// 为对象适配器创建接收器。
    fn acceptor(&self, adapter_name: &str) -> Result<Box<dyn Acceptor>>;

    /// 详细描述（文本形式）。
    fn to_detailed_string(&self) -> String {
        self.to_string()
    }
}

/// 跨种类比较：先比判别值，再交给具体实现。
pub fn compare_endpoints(left: &dyn Endpoint, right: &dyn Endpoint) -> Ordering {
    left.kind()
        .cmp(&right.kind())
        .then_with(|| left.compare(right))
}

impl PartialEq for dyn Endpoint {
    fn eq(&self, other: &Self) -> bool {
        compare_endpoints(self, other) == Ordering::Equal
    }
}

impl Eq for dyn Endpoint {}

impl PartialOrd for dyn Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for dyn Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_endpoints(self, other)
    }
}

impl Hash for dyn Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash_code());
    }
}
