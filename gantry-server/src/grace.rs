//! The graceful-restart listen primitive.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Listener factory used by the runtime for every (re)start.
///
/// The default binds a fresh socket; hosts doing graceful binary restarts
/// supply a function that hands back an inherited socket instead. The
/// returned listener must be non-blocking, ready for tokio registration.
pub type ListenFn = Arc<dyn Fn(SocketAddr) -> io::Result<std::net::TcpListener> + Send + Sync>;

/// The plain-bind listen function.
pub fn default_listen() -> ListenFn {
    Arc::new(|addr| {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    })
}
