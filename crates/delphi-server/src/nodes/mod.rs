//! The fixed file tree served over 9P.
//!
//! ```text
//! / (directory "llm")
//!   ask           prompt in, response out, per session
//!   new           any write resets the writing fid's session
//!   context       read = session history JSON; write = prepend system msg
//!   model         current model identifier
//!   temperature   sampling temperature in [0.0, 2.0]
//!   system        process-wide system prompt
//!   thinking      thinking token budget: "max" | "off" | integer
//!   prefill       assistant-response prefix
//!   tokens        last request token count
//!   usage         "<total>/<limit>"
//!   compact       write triggers compaction; read returns last status
//!   _example      usage help
//!   stream/
//!     ask         starts a streaming request
//!     chunk       blocking read of the next chunk; EOF ends the stream
//! ```

mod ask;
mod compact;
mod example;
mod session;
mod settings;
mod status;
mod stream;

pub use ask::AskFile;
pub use compact::CompactFile;
pub use example::example_file;
pub use session::{ContextFile, NewFile};
pub use settings::{ModelFile, PrefillFile, SystemFile, TemperatureFile, ThinkingFile};
pub use status::{TokensFile, UsageFile};
pub use stream::{ChunkFile, StreamAskFile};

use std::sync::Arc;

use delphi_llm::SessionManager;

use crate::fs::StaticDir;

/// Assemble the tree over a session manager and its shared backend.
pub fn build_root(sessions: Arc<SessionManager>) -> Arc<StaticDir> {
    let backend = sessions.backend().clone();

    let root = StaticDir::new("llm");
    root.add(Arc::new(AskFile::new(sessions.clone())));
    root.add(Arc::new(NewFile::new(sessions.clone())));
    root.add(Arc::new(ContextFile::new(sessions)));
    root.add(Arc::new(ModelFile::new(backend.clone())));
    root.add(Arc::new(TemperatureFile::new(backend.clone())));
    root.add(Arc::new(SystemFile::new(backend.clone())));
    root.add(Arc::new(ThinkingFile::new(backend.clone())));
    root.add(Arc::new(PrefillFile::new(backend.clone())));
    root.add(Arc::new(TokensFile::new(backend.clone())));
    root.add(Arc::new(UsageFile::new(backend.clone())));
    root.add(Arc::new(CompactFile::new(backend.clone())));
    root.add(Arc::new(example_file()));

    let stream = StaticDir::new("stream");
    stream.add(Arc::new(StreamAskFile::new(backend.clone())));
    stream.add(Arc::new(ChunkFile::new(backend)));
    root.add(Arc::new(stream));

    Arc::new(root)
}
