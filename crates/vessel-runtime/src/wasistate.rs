// Ported from microsoft/wassette (MIT License)
// Copyright (c) Microsoft Corporation.

use vessel_core::Handle;
use wasmtime::component::ResourceTable;
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder, WasiCtxView, WasiView};
use wasmtime_wasi_http::{WasiHttpCtx, WasiHttpView};

/// Per-invocation WASM state.
///
/// A fresh `WasiState` is created for each operation a component serves, so
/// components keep no state across invocations beyond their configuration.
///
/// Sandbox:
/// - No filesystem preopens
/// - Only `VESSEL_COMPONENT` and `VESSEL_HANDLE` in the environment
/// - Network access through WASI HTTP only
pub struct WasiState {
    ctx: WasiCtx,
    table: ResourceTable,
    http: WasiHttpCtx,
}

impl WasiView for WasiState {
    fn ctx(&mut self) -> WasiCtxView<'_> {
        WasiCtxView {
            ctx: &mut self.ctx,
            table: &mut self.table,
        }
    }
}

impl WasiHttpView for WasiState {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        &mut self.http
    }
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
}

impl WasiState {
    /// Sandbox for one invocation of component `name`.
    pub fn for_component(name: &str, handle: Handle) -> Self {
        let ctx = WasiCtxBuilder::new()
            .env("VESSEL_COMPONENT", name)
            .env("VESSEL_HANDLE", handle.to_string())
            .build();

        Self {
            ctx,
            table: ResourceTable::new(),
            http: WasiHttpCtx::new(),
        }
    }
}
