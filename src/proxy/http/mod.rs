mod body;
mod codec;
mod forward;
mod respond;
mod serve;
mod server;

pub use server::handle_http;
