mod handlers;
mod server;
mod stats;

pub use handlers::{part_for_frame, stream_terminator, STREAM_BOUNDARY};
pub use server::{router, RelayServer, ServerState};
pub use stats::StreamStats;
