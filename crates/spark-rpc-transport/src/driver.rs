//! 就绪循环驱动器。
//!
//! 生产环境中收发器由 RPC 核心的连接管理器驱动；这里提供一套基于 Tokio 的最小实现，
//! 供嵌入方与测试直接使用：反复调用状态机方法，根据返回的 [`SocketOperation`]
//! 等待对应就绪事件，直到操作完成。

use std::{future::poll_fn, time::Duration};

use crate::{
    buffer::Buffer,
    error::{Result, TransportError},
    operation::SocketOperation,
    transceiver::Transceiver,
};

async fn wait<T: Transceiver + ?Sized>(transceiver: &mut T, operation: SocketOperation) -> Result<()> {
    poll_fn(|cx| transceiver.poll_ready(cx, operation)).await
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    operation: &'static str,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| TransportError::Timeout { operation })?,
        None => future.await,
    }
}

/// 驱动 `initialize` 直至连接建立。
///
/// `deadline` 为整体时限；超时返回 [`TransportError::Timeout`]，收发器保持原状，
/// 由调用方决定是否 `close`。
pub async fn establish(
    transceiver: &mut dyn Transceiver,
    deadline: Option<Duration>,
) -> Result<()> {
    with_deadline(deadline, "connection establishment", async {
        loop {
            let operation = transceiver.initialize()?;
            if !operation.is_pending() {
                return Ok(());
            }
            wait(transceiver, operation).await?;
        }
    })
    .await
}

/// 写出 `buffer` 的全部剩余字节。
pub async fn write_all(transceiver: &mut dyn Transceiver, buffer: &mut Buffer) -> Result<()> {
    loop {
        let operation = transceiver.write(buffer)?;
        if !operation.is_pending() {
            return Ok(());
        }
        wait(transceiver, operation).await?;
    }
}

/// 读入直至 `buffer` 被填满。
pub async fn read_exact(transceiver: &mut dyn Transceiver, buffer: &mut Buffer) -> Result<()> {
    loop {
        let operation = transceiver.read(buffer)?;
        if !operation.is_pending() {
            return Ok(());
        }
        wait(transceiver, operation).await?;
    }
}

/// 优雅关闭：驱动 `closing` 直至完成，然后 `close`。
pub async fn shutdown(transceiver: &mut dyn Transceiver, deadline: Option<Duration>) -> Result<()> {
    let result = with_deadline(deadline, "connection shutdown", async {
        let mut operation = transceiver.closing(true)?;
        while operation.is_pending() {
            wait(transceiver, operation).await?;
            operation = transceiver.closing(true)?;
        }
        Ok(())
    })
    .await;
    transceiver.close();
    result
}
