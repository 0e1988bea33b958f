use std::sync::Arc;

use spark_rpc_transport::{
    Endpoint, EndpointFactory, EndpointFactoryRegistry, InputStream, Result,
};

use crate::{
    endpoint::{KIND, PROTOCOL, TlsEndpoint},
    instance::TlsInstance,
};

/// `ssl` 端点工厂：所有端点共享同一个 [`TlsInstance`]。
#[derive(Clone, Debug)]
pub struct TlsEndpointFactory {
    instance: Arc<TlsInstance>,
}

impl TlsEndpointFactory {
    pub fn new(instance: Arc<TlsInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<TlsInstance> {
        &self.instance
    }
}

impl EndpointFactory for TlsEndpointFactory {
    fn kind(&self) -> i16 {
        KIND
    }

    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn create(
        &self,
        args: &[String],
        adapter_endpoint: bool,
        text: &str,
    ) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(TlsEndpoint::parse(
            self.instance.clone(),
            args,
            adapter_endpoint,
            text,
        )?))
    }

    fn read(&self, input: &mut InputStream) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(TlsEndpoint::read(self.instance.clone(), input)?))
    }
}

/// 把 TLS 工厂注册进 `registry`。
pub fn register(registry: &mut EndpointFactoryRegistry, instance: Arc<TlsInstance>) {
    registry.add(Arc::new(TlsEndpointFactory::new(instance)));
}
