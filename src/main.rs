mod chat;
mod config;
mod room;
mod server;
mod session;
mod store;
mod utils;

#[actix::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    crate::server::http::start().await
}
