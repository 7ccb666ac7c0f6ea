//! External plugin runner. Loads a dynamic library via `libloading` and
//! calls its exported processing entry point on a blocking thread, since
//! the plugin contract is a synchronous C ABI and may do its own blocking
//! work.
//!
//! Plugin contract (C ABI):
//! ```c
//! int32_t eb_plugin_process(const uint8_t *input, size_t input_len,
//!                            uint8_t **out, size_t *out_len);
//! void eb_plugin_free(uint8_t *ptr, size_t len);
//! ```
//! A non-zero return from `eb_plugin_process` is treated as a processing
//! failure; `*out`/`*out_len` are only read on success and must be freed
//! with `eb_plugin_free`.

use async_trait::async_trait;
use eb_core::{EventBridgeError, Message, Operator, Result, Runner};
use libloading::{Library, Symbol};
use serde::Deserialize;
use serde_json::Value;
use std::os::raw::c_int;
use std::sync::Arc;
use validator::Validate;

type ProcessFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut u8, usize);

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PluginRunnerConfig {
    #[validate(length(min = 1))]
    pub library_path: String,
}

/// Holds the loaded library so its symbols stay valid for the runner's
/// lifetime. `Library` is `Send + Sync`; the symbols are re-resolved per
/// call rather than cached, since `Symbol` borrows from `Library`.
struct LoadedPlugin {
    library: Library,
}

impl LoadedPlugin {
    fn load(path: &str) -> anyhow::Result<Self> {
        let library = unsafe { Library::new(path)? };
        // Validate both required symbols exist at load time.
        unsafe {
            let _: Symbol<ProcessFn> = library.get(b"eb_plugin_process")?;
            let _: Symbol<FreeFn> = library.get(b"eb_plugin_free")?;
        }
        Ok(Self { library })
    }

    fn call(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        unsafe {
            let process: Symbol<ProcessFn> = self.library.get(b"eb_plugin_process")?;
            let free: Symbol<FreeFn> = self.library.get(b"eb_plugin_free")?;

            let mut out_ptr: *mut u8 = std::ptr::null_mut();
            let mut out_len: usize = 0;
            let status = process(input.as_ptr(), input.len(), &mut out_ptr, &mut out_len);
            if status != 0 {
                return Err(anyhow::anyhow!("plugin returned non-zero status {status}"));
            }
            if out_ptr.is_null() {
                return Ok(Vec::new());
            }
            let result = std::slice::from_raw_parts(out_ptr, out_len).to_vec();
            free(out_ptr, out_len);
            Ok(result)
        }
    }
}

pub struct PluginRunner {
    plugin: Arc<LoadedPlugin>,
}

impl PluginRunner {
    fn new(plugin: LoadedPlugin) -> Self {
        Self {
            plugin: Arc::new(plugin),
        }
    }
}

impl Operator for PluginRunner {
    fn name(&self) -> &str {
        "plugin"
    }
}

#[async_trait]
impl Runner for PluginRunner {
    async fn process(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        let plugin = self.plugin.clone();
        let output = tokio::task::spawn_blocking(move || plugin.call(&data))
            .await
            .map_err(|e| EventBridgeError::RunnerProcess(anyhow::anyhow!(e)))?
            .map_err(EventBridgeError::RunnerProcess)?;
        msg.set_data(output);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn build_runner(options: Value) -> anyhow::Result<Box<dyn Runner>> {
    let config: PluginRunnerConfig = crate::parse_options("plugin", options)?;
    let plugin = LoadedPlugin::load(&config.library_path)?;
    Ok(Box::new(PluginRunner::new(plugin)))
}
