//! High-level session: composes a transport, the protocol client, the
//! symbol tables and the DAQ engine behind the caller-facing surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::client::XcpClient;
use crate::config::{SessionConfig, TransportConfig};
use crate::daq::{DaqEngine, SampleStream};
use crate::error::{Error, Result};
use crate::protocol::ConnectionState;
use crate::symbols::dwarf::{self, ImageSymbols};
use crate::symbols::modelmap::{self, ModelMap};
use crate::symbols::Symbol;
use crate::target::TargetMemory;
use crate::transport::{SerialTransport, TcpTransport, Transport};
use crate::value::Value;
use crate::variables;

/// One live connection to a target plus the symbol sources loaded for it.
pub struct Session {
    config: SessionConfig,
    client: XcpClient,
    image: Option<ImageSymbols>,
    model: Option<ModelMap>,
    daq: Option<DaqEngine>,
}

impl Session {
    /// Open the configured transport and connect. When the configuration
    /// names an image, its symbols are loaded as well.
    #[instrument(skip(config), fields(transport = ?config.transport))]
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Tcp { host, port } => Arc::new(TcpTransport::connect(host, *port)?),
            TransportConfig::Serial { port, baud } => Arc::new(SerialTransport::open(port, *baud)?),
        };
        Self::connect_on(transport, config)
    }

    /// Connect over an already-open transport.
    pub fn connect_on(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        let client = XcpClient::connect(
            transport,
            Duration::from_millis(config.command_timeout_ms),
        )?;
        let mut session = Self {
            config,
            client,
            image: None,
            model: None,
            daq: None,
        };
        if let Some(path) = session.config.image_path.clone() {
            session.load_symbols(Path::new(&path))?;
        }
        Ok(session)
    }

    pub fn client(&self) -> &XcpClient {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Load the DWARF symbol table from a linked image.
    ///
    /// When configured, the image's `.version_info` section is compared
    /// against the same addresses on the target first: symbols from a
    /// stale image would silently read the wrong memory.
    pub fn load_symbols(&mut self, image_path: &Path) -> Result<()> {
        let image = dwarf::read_image(image_path)?;
        if self.config.verify_image_version {
            if let Some(version) = &image.version_section {
                let on_target = self
                    .client
                    .read_memory(version.address, version.data.len())?;
                if on_target != version.data {
                    return Err(Error::ImageVersionMismatch);
                }
            }
        }
        info!(
            image = %image_path.display(),
            symbols = image.symbols.len(),
            "image symbols loaded"
        );
        self.image = Some(image);
        Ok(())
    }

    /// Read the model map rooted at the configured symbol.
    pub fn load_model_map(&mut self) -> Result<()> {
        let root_symbol = self.config.model_map_symbol.clone();
        self.load_model_map_at(&root_symbol)
    }

    /// Read the model map rooted at a named symbol from the loaded image.
    pub fn load_model_map_at(&mut self, root_symbol: &str) -> Result<()> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| Error::UnknownSymbol(root_symbol.to_string()))?;
        let root = image.symbols.resolve(root_symbol)?;
        self.load_model_map_at_address(root.address)
    }

    /// Read the model map rooted at an explicit address. The map is read
    /// once and cached for the rest of the session.
    pub fn load_model_map_at_address(&mut self, address: u64) -> Result<()> {
        let map = modelmap::read_model_map(&self.client, self.client.byte_order(), address)?;
        info!(
            model = map.model_path.as_deref().unwrap_or("?"),
            symbols = map.symbols.len(),
            "model map loaded"
        );
        self.model = Some(map);
        Ok(())
    }

    pub fn model_map(&self) -> Option<&ModelMap> {
        self.model.as_ref()
    }

    /// Resolve a path against the loaded symbol sources: the model map
    /// first, then the image symbols.
    pub fn resolve(&self, path: &str) -> Result<Symbol> {
        if let Some(model) = &self.model {
            match model.symbols.resolve(path) {
                Err(Error::UnknownSymbol(_)) => {}
                other => return other,
            }
        }
        if let Some(image) = &self.image {
            match image.symbols.resolve(path) {
                Err(Error::UnknownSymbol(_)) => {}
                other => return other,
            }
        }
        Err(Error::UnknownSymbol(path.to_string()))
    }

    /// All known root paths, model map first.
    pub fn symbol_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(model) = &self.model {
            paths.extend(model.symbols.paths().map(String::from));
        }
        if let Some(image) = &self.image {
            paths.extend(image.symbols.paths().map(String::from));
        }
        paths
    }

    pub fn read(&self, symbol: &Symbol) -> Result<Value> {
        variables::read(&self.client, self.client.byte_order(), symbol)
    }

    pub fn write(&self, symbol: &Symbol, value: &Value) -> Result<()> {
        variables::write(&self.client, self.client.byte_order(), symbol, value)
    }

    /// Resolve and read in one step.
    pub fn read_path(&self, path: &str) -> Result<Value> {
        let symbol = self.resolve(path)?;
        self.read(&symbol)
    }

    /// Resolve and write in one step.
    pub fn write_path(&self, path: &str, value: &Value) -> Result<()> {
        let symbol = self.resolve(path)?;
        self.write(&symbol, value)
    }

    /// Group the given (path, event channel) pairs into DAQ lists and
    /// write the configuration to the target.
    pub fn daq_configure<'a, I>(&mut self, signals: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, u16)>,
    {
        let mut resolved = Vec::new();
        for (path, event_channel) in signals {
            resolved.push((self.resolve(path)?, event_channel));
        }
        let engine = DaqEngine::configure(&self.client, &resolved, self.config.daq)?;
        self.daq = Some(engine);
        Ok(())
    }

    fn daq_engine(&self, command: &'static str) -> Result<&DaqEngine> {
        self.daq.as_ref().ok_or(Error::InvalidState {
            command,
            state: self.client.state(),
        })
    }

    pub fn daq_start(&self) -> Result<()> {
        self.daq_engine("START_STOP_SYNCH")?.start(&self.client)
    }

    /// Consumer handle for the sample stream.
    pub fn daq_samples(&self) -> Result<SampleStream> {
        Ok(self.daq_engine("DAQ")?.samples())
    }

    pub fn daq_stop(&self) -> Result<()> {
        self.daq_engine("START_STOP_SYNCH")?.stop(&self.client)
    }

    /// Stop DAQ if running, disconnect and close the transport.
    pub fn disconnect(mut self) -> Result<()> {
        if let Some(daq) = self.daq.take() {
            if self.client.state() == ConnectionState::DaqRunning {
                if let Err(e) = daq.stop(&self.client) {
                    warn!(error = %e, "failed to stop DAQ during disconnect");
                }
            }
        }
        self.client.disconnect()
    }
}
