//! The `_example` help file.

use crate::fs::StaticFile;

const EXAMPLE_TEXT: &str = r#"LLM 9P Filesystem Usage Examples
=================================

Basic Interaction:
  echo "What is 2+2?" > ask     # Send prompt to LLM
  cat ask                        # Read response

Configuration:
  cat model                      # View current model
  echo "claude-3-haiku-20240307" > model   # Change model
  cat temperature                # View current temperature (0.0-2.0)
  echo "0.5" > temperature       # Set temperature
  echo "You answer in rhyme." > system     # Set the system prompt
  echo "max" > thinking          # Thinking budget: max, off, or a number
  echo "[Narrator] " > prefill   # Prefix every assistant response

Conversation Management:
  cat context                    # View this session's history (JSON)
  echo "Prefer SI units." > context        # Add a system message
  echo "" > new                  # Reset this session

Token Usage:
  cat tokens                     # Tokens consumed by the last request
  cat usage                      # Cumulative usage: total/limit
  echo "1" > compact             # Summarise history to reclaim context
  cat compact                    # Compaction status: ready / ok / error

Streaming (Advanced):
  echo "Tell me a story" > stream/ask      # Start generating
  cat stream/chunk               # Read chunks as they arrive (blocks)

Shell Scripting:
  #!/bin/sh
  # Ask the LLM and get the response
  echo "$1" > /mnt/llm/ask
  cat /mnt/llm/ask

Mounting (Linux/macOS):
  # Using 9pfuse (Plan 9 from User Space)
  9pfuse localhost:5640 /mnt/llm

  # Using mount_9p (macOS with plan9port)
  mount_9p localhost:5640 /mnt/llm

Sessions:
  Each mount (strictly: each fid) gets its own conversation history.
  Two terminals mounting the same server talk to the same model with
  independent contexts.

Files:
  ask          Read/write: prompt goes in, response comes out
  new          Write-only: any write resets this session
  context      Read: JSON history; Write: add system message
  model        Read/write: current model name
  temperature  Read/write: sampling temperature (0.0-2.0)
  system       Read/write: process-wide system prompt
  thinking     Read/write: thinking budget (max|off|number)
  prefill      Read/write: assistant response prefix
  tokens       Read-only: token count from last request
  usage        Read-only: cumulative tokens / context limit
  compact      Read/write: trigger + status of compaction
  _example     Read-only: this help text
  stream/ask   Write-only: start a streaming request
  stream/chunk Read-only: streaming chunks (blocking)
"#;

/// Build the static `_example` node.
pub fn example_file() -> StaticFile {
    StaticFile::new("_example", EXAMPLE_TEXT.as_bytes())
}
