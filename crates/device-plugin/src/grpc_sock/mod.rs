//! A client/server implementation using UNIX sockets for gRPC, meant for use
//! with tonic. Socket support is not built in to tonic, so the server half
//! wraps a `UnixListener` in a connection stream and the client half dials a
//! socket path through a tower connector. The listener hands out any number
//! of accept streams so a crashed serve loop can resume on the same bound
//! socket without rebinding.

pub mod client;
pub mod server;
