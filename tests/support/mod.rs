pub mod fixtures;
pub mod harness;
pub mod http_utils;
pub mod net;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use harness::*;
#[allow(unused_imports)]
pub use http_utils::*;
#[allow(unused_imports)]
pub use net::*;
