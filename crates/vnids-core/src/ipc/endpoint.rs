//! Local rendezvous point for the control socket.
//!
//! A configured name starting with `@` selects the Linux abstract socket
//! namespace; anything else is a filesystem path.

use std::fmt;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

/// Where the daemon listens and clients connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Path(PathBuf),
    Abstract(String),
}

impl Endpoint {
    pub fn parse(name: &str) -> Self {
        match name.strip_prefix('@') {
            Some(abstract_name) => Endpoint::Abstract(abstract_name.to_string()),
            None => Endpoint::Path(PathBuf::from(name)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Endpoint::Path(path) => Some(path),
            Endpoint::Abstract(_) => None,
        }
    }

    /// Bind a listener, replacing a stale socket file left by a previous
    /// run. A live socket or a non-socket file at the path fails the bind.
    pub fn bind(&self, mode: u32) -> io::Result<UnixListener> {
        match self {
            Endpoint::Path(path) => {
                prepare_path(path)?;
                let listener = UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
                info!(path = %path.display(), mode = %format!("{mode:o}"), "control socket bound");
                Ok(listener)
            }
            Endpoint::Abstract(name) => {
                let listener = bind_abstract(name)?;
                info!(name = %name, "abstract control socket bound");
                Ok(listener)
            }
        }
    }

    pub async fn connect(&self) -> io::Result<UnixStream> {
        match self {
            Endpoint::Path(path) => UnixStream::connect(path).await,
            Endpoint::Abstract(name) => connect_abstract(name),
        }
    }

    /// Remove the socket file, if any. Abstract sockets vanish on their own.
    pub fn cleanup(&self) {
        if let Endpoint::Path(path) = self
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            debug!(path = %path.display(), error = %e, "failed to remove control socket");
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Path(path) => write!(f, "{}", path.display()),
            Endpoint::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

fn prepare_path(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another daemon is listening on {}", path.display()),
        ));
    }
    debug!(path = %path.display(), "removing stale control socket");
    std::fs::remove_file(path)
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket @{name} requires Linux"),
    ))
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket @{name} requires Linux"),
    ))
}
