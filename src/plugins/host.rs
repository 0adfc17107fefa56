use wasmtime_wasi::{WasiCtx, WasiCtxView, WasiView};

use super::bindings::tankobon::plugin::{http, types};
use crate::fetch::{FetchCapability, FetchRequest, Method, ResponseType};

// Host context: WASI stdio plus the provider's restricted fetch capability
pub(crate) struct Host {
    pub(crate) wasi: WasiCtx,
    pub(crate) table: wasmtime::component::ResourceTable,
    pub(crate) fetch: FetchCapability,
    pub(crate) runtime: tokio::runtime::Handle,
}

impl WasiView for Host {
    fn ctx(&mut self) -> WasiCtxView<'_> {
        WasiCtxView {
            ctx: &mut self.wasi,
            table: &mut self.table,
        }
    }
}

impl types::Host for Host {}

impl http::Host for Host {
    // Plugin calls run on a blocking thread, so bridging back into the runtime is allowed here.
    fn fetch(&mut self, request: http::Request) -> Result<http::Response, String> {
        let req = FetchRequest {
            url: request.url,
            method: request.method.into(),
            headers: request.headers,
            body: request.body,
            response_type: request.response_type.into(),
        };
        self.runtime
            .block_on(self.fetch.send(req))
            .map(|r| http::Response {
                status: r.status,
                url: r.url,
                headers: r.headers,
                body: r.body,
            })
            .map_err(|e| {
                tracing::debug!(error = %e, "provider fetch failed");
                e.to_string()
            })
    }
}

impl From<http::Method> for Method {
    fn from(m: http::Method) -> Self {
        match m {
            http::Method::Get => Method::Get,
            http::Method::Post => Method::Post,
            http::Method::Put => Method::Put,
            http::Method::Delete => Method::Delete,
            http::Method::Head => Method::Head,
        }
    }
}

impl From<http::ResponseType> for ResponseType {
    fn from(t: http::ResponseType) -> Self {
        match t {
            http::ResponseType::Json => ResponseType::Json,
            http::ResponseType::Binary => ResponseType::Binary,
            http::ResponseType::Text => ResponseType::Text,
        }
    }
}
