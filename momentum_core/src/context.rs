//! Per-process handle on the transport.
//!
//! A [`Context`] owns the streams it opened, its subscriptions and the dispatch
//! loop delivering them. Dropping it (or calling [`Context::close`]) cancels
//! every blocked operation, stops dispatch, releases consumer ids and unmaps
//! the segments.

use crate::communication::subscriber::Dispatcher;
use crate::communication::{Handler, HandlerPanic, Stream, StreamOptions};
use crate::config::MomentumConfig;
use crate::error::{MomentumError, MomentumResult};
use crate::memory::stream_object_name;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Builder for [`Context`]
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: Option<MomentumConfig>,
    manual_dispatch: bool,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: MomentumConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Deliver only from [`Context::dispatch`] instead of a background thread
    pub fn manual_dispatch(mut self, manual: bool) -> Self {
        self.manual_dispatch = manual;
        self
    }

    pub fn build(self) -> MomentumResult<Context> {
        let config = match self.config {
            Some(config) => config,
            None => MomentumConfig::from_env()?,
        };
        let cancel = Arc::new(AtomicBool::new(false));

        Ok(Context {
            config,
            dispatcher: Arc::new(Dispatcher::new(cancel.clone())),
            cancel,
            streams: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            manual_dispatch: self.manual_dispatch,
        })
    }
}

pub struct Context {
    config: MomentumConfig,
    cancel: Arc<AtomicBool>,
    streams: Mutex<HashMap<String, Stream>>,
    dispatcher: Arc<Dispatcher>,
    worker: Mutex<Option<JoinHandle<()>>>,
    manual_dispatch: bool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("streams", &self.streams.lock().keys().collect::<Vec<_>>())
            .field("manual_dispatch", &self.manual_dispatch)
            .finish()
    }
}

impl Context {
    /// Context configured from the environment and `.momentumrc` files
    pub fn new() -> MomentumResult<Self> {
        ContextBuilder::new().build()
    }

    pub fn with_config(config: MomentumConfig) -> MomentumResult<Self> {
        ContextBuilder::new().config(config).build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub fn config(&self) -> &MomentumConfig {
        &self.config
    }

    fn check_open(&self) -> MomentumResult<()> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(MomentumError::Cancelled);
        }
        Ok(())
    }

    /// Open (creating if needed) a stream with the given shape
    pub fn stream(
        &self,
        name: &str,
        buffer_size: usize,
        buffer_count: usize,
        broadcast: bool,
    ) -> MomentumResult<Stream> {
        self.stream_with(
            name,
            StreamOptions::new(buffer_size, buffer_count).broadcast(broadcast),
        )
    }

    /// Open (creating if needed) a stream with full options.
    ///
    /// Fails with `ConfigMismatch` if the stream exists with another shape or
    /// broadcast flag.
    pub fn stream_with(&self, name: &str, options: StreamOptions) -> MomentumResult<Stream> {
        self.check_open()?;
        let key = stream_object_name(name)?;
        let mut streams = self.streams.lock();

        if let Some(stream) = streams.get(&key) {
            let current = stream.options();
            if current.buffer_size != options.buffer_size
                || current.buffer_count != options.buffer_count
                || current.broadcast != options.broadcast
            {
                return Err(MomentumError::mismatch(
                    key,
                    format!(
                        "already open as {} x {} bytes (broadcast={})",
                        current.buffer_count, current.buffer_size, current.broadcast
                    ),
                ));
            }
            return Ok(stream.clone());
        }

        let stream = Stream::open_or_create(&self.config.data_path, &key, options, self.cancel.clone())?;
        streams.insert(key, stream.clone());
        Ok(stream)
    }

    /// Attach to an existing stream using the shape recorded in its header
    pub fn open_stream(&self, name: &str) -> MomentumResult<Stream> {
        self.check_open()?;
        let key = stream_object_name(name)?;
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(&key) {
            return Ok(stream.clone());
        }
        let stream = Stream::attach(&self.config.data_path, &key, self.cancel.clone())?;
        streams.insert(key, stream.clone());
        Ok(stream)
    }

    /// Deliver every publication on `stream` made from now on to `handler`.
    ///
    /// The stream must already exist. Unless the context uses manual
    /// dispatch, the first subscription starts the dispatch thread.
    pub fn subscribe<H>(&self, stream: &str, handler: H) -> MomentumResult<()>
    where
        H: Handler + 'static,
    {
        let stream = self.open_stream(stream)?;
        self.dispatcher.subscribe(&stream, Box::new(handler))?;
        if !self.manual_dispatch {
            self.ensure_worker()?;
        }
        Ok(())
    }

    fn ensure_worker(&self) -> MomentumResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let dispatcher = self.dispatcher.clone();
        let handle = std::thread::Builder::new()
            .name("momentum-dispatch".to_string())
            .spawn(move || dispatcher.run())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Run one dispatch round on the calling thread.
    ///
    /// Waits up to `timeout` for the first publication and returns how many
    /// payloads were delivered. Only meaningful with manual dispatch.
    pub fn dispatch(&self, timeout: Duration) -> MomentumResult<usize> {
        if !self.manual_dispatch {
            return Err(MomentumError::invalid_input(
                "dispatch() requires a context built with manual_dispatch(true)",
            ));
        }
        self.dispatcher.dispatch(timeout)
    }

    /// Handler panics recorded since the last call
    pub fn take_errors(&self) -> Vec<HandlerPanic> {
        self.dispatcher.take_errors()
    }

    pub fn has_subscriptions(&self) -> bool {
        self.dispatcher.has_subscriptions()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Tear the context down; later calls are no-ops
    pub fn close(&self) {
        if self.cancel.swap(true, Ordering::AcqRel) {
            return;
        }

        let streams: Vec<Stream> = self.streams.lock().values().cloned().collect();
        for stream in &streams {
            stream.pool().wake_all();
        }

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                log::warn!("Context closed from its own dispatch thread; not joining");
            } else if handle.join().is_err() {
                log::error!("Dispatch thread panicked");
            }
        }

        self.dispatcher.shutdown();
        self.streams.lock().clear();
        log::debug!("Context closed ({} streams released)", streams.len());
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}
