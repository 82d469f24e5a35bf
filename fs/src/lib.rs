//! File system persistence for the GATT engine.
//!
//! [`FsStore`] keeps the handle ranges assigned to application services in
//! `handles.json` and one file per service-changed client, named after the
//! peer address (`P-001122334455` or `R-001122334455`).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, io};

use tracing::{debug, error, info, warn};

use burble_gatt::gatt::{Config, ServiceRange, SrvChgClient, SrvChgCmd, Store};
use burble_gatt::le::Addr;

/// GATT engine store in a file system directory.
#[derive(Clone, Debug)]
pub struct FsStore(Dir);

impl FsStore {
    const NAME: &'static str = "gatt";
    const HANDLES: &'static str = "handles.json";

    /// Creates or opens a store in the specified root directory.
    #[inline(always)]
    #[must_use]
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self(Dir::open(root, Self::NAME))
    }

    /// Creates or opens a store in the current user's local data directory.
    /// Returns [`None`] if the user directory cannot be determined.
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>) -> Option<Self> {
        Dir::per_user(app, Self::NAME).map(Self)
    }

    /// Returns the saved application service handle ranges.
    #[must_use]
    pub fn handle_ranges(&self) -> Vec<ServiceRange> {
        self.0.load(Self::HANDLES).unwrap_or_default()
    }
}

impl Store for FsStore {
    fn handle_range_changed(&mut self, added: bool, r: &ServiceRange) {
        let mut v = self.handle_ranges();
        v.retain(|o| o.range != r.range);
        if added {
            v.push(*r);
            v.sort_unstable_by_key(|o| o.range.start());
        }
        self.0.save(Self::HANDLES, &v);
    }

    fn srv_chg_client_updated(&mut self, cmd: SrvChgCmd, c: &SrvChgClient) {
        let name = peer_file(c.peer);
        match cmd {
            SrvChgCmd::Add | SrvChgCmd::Update => {
                self.0.save(&name, c);
            }
            SrvChgCmd::Remove => self.0.remove(&name),
        }
    }

    fn load_srv_chg_clients(&mut self) -> Vec<SrvChgClient> {
        let rd = match fs::read_dir(&self.0 .0) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!("Failed to read: {} ({e})", self.0 .0.display());
                return Vec::new();
            }
        };
        let mut v: Vec<SrvChgClient> = (rd.filter_map(|e| e.ok()?.file_name().into_string().ok()))
            .filter(|name| is_peer_file(name))
            .filter_map(|name| self.0.load(&name))
            .collect();
        v.sort_unstable_by_key(|c| c.peer);
        info!("Loaded {} service-changed client(s)", v.len());
        v
    }
}

/// Loads engine configuration from a JSON file. Missing fields take their
/// default values. A missing file yields the default configuration.
pub fn load_config(path: impl AsRef<Path>) -> io::Result<Config> {
    let path = path.as_ref();
    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No configuration at {}", path.display());
            return Ok(Config::default());
        }
        Err(e) => return Err(e),
    };
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Returns the file name for the specified peer address.
fn peer_file(peer: Addr) -> String {
    let (raw, typ) = match peer {
        Addr::Public(raw) => (raw, 'P'),
        Addr::Random(raw) => (raw, 'R'),
    };
    let b = raw.as_le_bytes();
    format!(
        "{typ}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        b[5], b[4], b[3], b[2], b[1], b[0]
    )
}

/// Returns whether `name` has the format produced by [`peer_file`].
fn is_peer_file(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() == 14
        && matches!(b[0], b'P' | b'R')
        && b[1] == b'-'
        && b[2..].iter().all(u8::is_ascii_hexdigit)
}

/// JSON files in a file system directory.
#[derive(Clone, Debug)]
#[repr(transparent)]
struct Dir(PathBuf);

impl Dir {
    /// Opens a directory under the specified root.
    #[inline(always)]
    #[must_use]
    fn open(root: impl AsRef<Path>, name: impl AsRef<Path>) -> Self {
        Self(root.as_ref().join(name))
    }

    /// Opens a directory under the current user's local data directory.
    #[must_use]
    fn per_user(app: impl AsRef<Path>, name: impl AsRef<Path>) -> Option<Self> {
        let Some(dir) = dirs::data_local_dir() else {
            warn!("User data directory not available");
            return None;
        };
        Some(Self(dir.join(app.as_ref()).join(name)))
    }

    /// Saves a value to the specified file.
    fn save(&self, name: &str, v: &impl serde::ser::Serialize) -> bool {
        let s = match serde_json::to_string_pretty(v) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize {name} ({e})");
                return false;
            }
        };
        if let Err(e) = fs::create_dir_all(&self.0) {
            warn!("Failed to create directory: {} ({e})", self.0.display());
        }
        let path = self.0.join(name);
        match fs::File::create(&path)
            .and_then(|mut f| f.write_all(s.as_bytes()).and_then(|_| f.sync_data()))
        {
            Ok(_) => {
                debug!("Wrote: {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write: {} ({e})", path.display());
                false
            }
        }
    }

    /// Loads a value from the specified file.
    fn load<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.0.join(name);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return None;
            }
        };
        serde_json::from_str(&s)
            .map_err(|e| error!("Invalid file contents: {} ({e})", path.display()))
            .ok()
    }

    /// Removes the specified file.
    fn remove(&self, name: &str) {
        let path = self.0.join(name);
        match fs::remove_file(&path) {
            Ok(_) => debug!("Removed: {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!("Failed to remove: {} ({e})", path.display()),
        }
    }
}
