#![allow(dead_code)]

pub mod harness;
pub mod http_utils;
pub mod net;
pub mod upstream;

pub use harness::{ProxyHarness, ProxyHarnessBuilder};
pub use http_utils::{HttpResponse, proxy_get, send_raw};
pub use net::free_local_addr;
pub use upstream::TestUpstream;
