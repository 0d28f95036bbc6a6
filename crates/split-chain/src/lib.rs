//! Chain gateway clients: the shared websocket event stream, the REST
//! transaction lookup, and proxy-address derivation.

pub mod proxy;
pub mod query;
pub mod stream;

pub use proxy::derive_proxy;
pub use query::TonCenterClient;
pub use stream::ChainStream;
