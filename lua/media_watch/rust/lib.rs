pub mod bridge;
pub mod config;
pub mod error;
pub mod log;
pub mod path_utils;
pub mod types;

pub use bridge::{
    CallbackSink, ChangeBridge, ChangeSink, ChangeStream, ManualSource, NativeSignal,
    NotifySource, ObserverHandle, RegistrationToken, StreamItem, SubscriptionState,
};
pub use config::{BridgeConfig, WatchScope};
pub use error::{Error, Result};
pub use types::{ChangeEvent, ChangeKind, ChangePayload};

#[cfg(feature = "lua")]
mod lua_module {
    use mlua::prelude::*;
    use once_cell::sync::Lazy;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard};
    use std::sync::mpsc::TryRecvError;
    use tracing::{debug, error};

    use crate::bridge::{ChangeBridge, ChangeStream, StreamItem};
    use crate::config::BridgeConfig;
    use crate::error::Error;
    use crate::types::ChangePayload;

    const DEFAULT_POLL_LIMIT: usize = 256;

    #[derive(Default)]
    struct HostSubscription {
        bridge: Option<ChangeBridge>,
        stream: Option<ChangeStream>,
    }

    // Lua cannot be re-entered from the watcher thread, so events are queued
    // on a channel and drained by `poll`.
    static HOST: Lazy<Mutex<HostSubscription>> =
        Lazy::new(|| Mutex::new(HostSubscription::default()));

    fn host() -> MutexGuard<'static, HostSubscription> {
        match HOST.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Host subscription mutex poisoned, recovering: {:?}", poisoned);
                poisoned.into_inner()
            }
        }
    }

    fn init_tracing(
        _: &Lua,
        (log_file, level): (Option<String>, Option<String>),
    ) -> LuaResult<bool> {
        let log_file = log_file.map(PathBuf::from);
        Ok(crate::log::init_tracing(
            log_file.as_deref(),
            level.as_deref().unwrap_or("info"),
        )?)
    }

    fn attach(
        _: &Lua,
        (root, recursive, debounce_ms): (Option<String>, Option<bool>, Option<u64>),
    ) -> LuaResult<bool> {
        let mut config = BridgeConfig::default()
            .recursive(recursive.unwrap_or(true))
            .debounce_ms(debounce_ms.unwrap_or(0));
        if let Some(root) = root {
            config = config.with_root(root);
        }

        let mut host = host();
        let reuse = host
            .bridge
            .as_ref()
            .is_some_and(|bridge| bridge.is_configured_for(&config));
        if !reuse {
            // Dropping the old bridge detaches it.
            host.stream = None;
            host.bridge = Some(ChangeBridge::with_notify(config));
        }

        let Some(bridge) = host.bridge.as_ref() else {
            return Err(Error::NotAttached.into());
        };
        match bridge.subscribe() {
            Ok(stream) => {
                host.stream = Some(stream);
                Ok(true)
            }
            Err(e) => {
                host.stream = None;
                Err(e.into())
            }
        }
    }

    fn poll(_: &Lua, max: Option<usize>) -> LuaResult<Vec<ChangePayload>> {
        let mut host = host();
        let Some(stream) = host.stream.as_ref() else {
            return Err(Error::NotAttached.into());
        };

        let max = max.unwrap_or(DEFAULT_POLL_LIMIT);
        let mut payloads = Vec::new();
        while payloads.len() < max {
            match stream.try_recv() {
                Ok(StreamItem::Event(event)) => payloads.push(event.to_payload()),
                Ok(StreamItem::Failed(message)) => {
                    host.stream = None;
                    return Err(LuaError::RuntimeError(message));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Change stream closed while polling");
                    host.stream = None;
                    break;
                }
            }
        }

        Ok(payloads)
    }

    fn cancel(_: &Lua, _: ()) -> LuaResult<()> {
        let mut host = host();
        if let Some(bridge) = host.bridge.as_ref() {
            bridge.detach();
        }
        host.stream = None;
        Ok(())
    }

    fn is_attached(_: &Lua, _: ()) -> LuaResult<bool> {
        Ok(host().bridge.as_ref().is_some_and(ChangeBridge::is_attached))
    }

    fn shutdown(_: &Lua, _: ()) -> LuaResult<()> {
        let mut host = host();
        host.stream = None;
        host.bridge = None;
        Ok(())
    }

    #[mlua::lua_module]
    fn media_watch(lua: &Lua) -> LuaResult<LuaTable> {
        let exports = lua.create_table()?;
        exports.set("init_tracing", lua.create_function(init_tracing)?)?;
        exports.set("attach", lua.create_function(attach)?)?;
        exports.set("poll", lua.create_function(poll)?)?;
        exports.set("cancel", lua.create_function(cancel)?)?;
        exports.set("is_attached", lua.create_function(is_attached)?)?;
        exports.set("shutdown", lua.create_function(shutdown)?)?;
        Ok(exports)
    }
}
