//! Transport and codec layer of quickrpc: two-way byte channels with an explicit start / run / stop
//!  lifecycle, multiplexing of many channels into one receive stream, automatic reconnection, and
//!  the newline-delimited 'terse' wire encoding.

pub mod codec;
pub mod config;
pub mod error;
pub mod transport;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
