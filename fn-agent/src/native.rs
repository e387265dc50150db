//! Native in-process applications loaded from shared objects.
//!
//! A plugin exports one entrypoint with the [`EntryPoint`] signature. It
//! receives the msgpack-encoded scope and a [`HostApi`] table:
//!
//! - `receive` fills `data`/`len` with a msgpack request event. The buffer
//!   stays valid until the next `receive` or until the entrypoint returns.
//! - `send` queues one msgpack response message.
//! - `fail` records an error message; the call then fails with it.
//!
//! A non-zero return value fails the call. Plugins run with the agent's
//! full privileges on a blocking thread.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use fn_proto::Scope;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use crate::app::{AppChannel, Application};
use crate::loader::PluginLoader;

#[repr(C)]
pub struct HostApi {
    pub ctx: *mut c_void,
    pub receive: unsafe extern "C" fn(*mut c_void, *mut *const u8, *mut usize) -> c_int,
    pub send: unsafe extern "C" fn(*mut c_void, *const u8, usize) -> c_int,
    pub fail: unsafe extern "C" fn(*mut c_void, *const u8, usize),
}

pub type EntryPoint = unsafe extern "C" fn(*const u8, usize, *const HostApi) -> c_int;

/// Handle from `dlopen`. Kept open for the lifetime of the agent.
pub struct Library {
    handle: *mut c_void,
}

// dlopen handles may be used from any thread
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    pub fn open(path: &Path) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("library path {} contains NUL", path.display()))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            bail!("dlopen {}: {}", path.display(), last_dl_error());
        }
        Ok(Self { handle })
    }

    /// Look up an entrypoint by name.
    pub fn entry_point(&self, name: &str) -> Result<EntryPoint> {
        let c_name =
            CString::new(name).with_context(|| format!("symbol name {:?} contains NUL", name))?;
        let symbol = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if symbol.is_null() {
            bail!("dlsym {}: {}", name, last_dl_error());
        }
        Ok(unsafe { std::mem::transmute::<*mut c_void, EntryPoint>(symbol) })
    }
}

fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown error".into()
    } else {
        unsafe { CStr::from_ptr(err as *const c_char) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Loads applications with `dlopen`.
pub struct NativeLoader;

impl PluginLoader for NativeLoader {
    fn load(&self, path: &Path, symbol: &str) -> Result<Arc<dyn Application>> {
        let library = Library::open(path)?;
        let entry = library.entry_point(symbol)?;
        Ok(Arc::new(NativeApp {
            _library: library,
            entry,
        }))
    }
}

struct NativeApp {
    _library: Library,
    entry: EntryPoint,
}

#[async_trait]
impl Application for NativeApp {
    async fn call(&self, scope: Scope, channel: AppChannel) -> Result<()> {
        let scope = fn_proto::encode(&scope).context("encoding scope")?;
        let entry = self.entry;
        tokio::task::spawn_blocking(move || invoke(entry, &scope, channel))
            .await
            .context("application thread")?
    }
}

struct CallContext {
    channel: AppChannel,
    event: Vec<u8>,
    error: Option<anyhow::Error>,
}

fn invoke(entry: EntryPoint, scope: &[u8], channel: AppChannel) -> Result<()> {
    let mut ctx = CallContext {
        channel,
        event: Vec::new(),
        error: None,
    };
    let host = HostApi {
        ctx: &mut ctx as *mut CallContext as *mut c_void,
        receive: host_receive,
        send: host_send,
        fail: host_fail,
    };

    let status = unsafe { entry(scope.as_ptr(), scope.len(), &host) };

    if let Some(error) = ctx.error.take() {
        return Err(error);
    }
    if status != 0 {
        bail!("entrypoint returned status {}", status);
    }
    Ok(())
}

unsafe extern "C" fn host_receive(ctx: *mut c_void, data: *mut *const u8, len: *mut usize) -> c_int {
    if ctx.is_null() || data.is_null() || len.is_null() {
        return -1;
    }
    let ctx = &mut *(ctx as *mut CallContext);
    let event = ctx.channel.receive();
    match fn_proto::encode(&event) {
        Ok(bytes) => {
            ctx.event = bytes;
            *data = ctx.event.as_ptr();
            *len = ctx.event.len();
            0
        }
        Err(e) => {
            ctx.error
                .get_or_insert(anyhow::Error::new(e).context("encoding request event"));
            -1
        }
    }
}

unsafe extern "C" fn host_send(ctx: *mut c_void, data: *const u8, len: usize) -> c_int {
    if ctx.is_null() || (data.is_null() && len > 0) {
        return -1;
    }
    let ctx = &mut *(ctx as *mut CallContext);
    let mut bytes: &[u8] = if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, len)
    };
    let result = rmpv::decode::read_value(&mut bytes)
        .context("decoding response message")
        .and_then(|message| ctx.channel.send(message));
    match result {
        Ok(()) => 0,
        Err(e) => {
            ctx.error.get_or_insert(e);
            -1
        }
    }
}

unsafe extern "C" fn host_fail(ctx: *mut c_void, message: *const u8, len: usize) {
    if ctx.is_null() {
        return;
    }
    let ctx = &mut *(ctx as *mut CallContext);
    let text = if message.is_null() {
        "application failed".to_string()
    } else {
        String::from_utf8_lossy(std::slice::from_raw_parts(message, len)).into_owned()
    };
    ctx.error.get_or_insert(anyhow!(text));
}
