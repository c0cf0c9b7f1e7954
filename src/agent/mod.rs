//! Assistant adapters

mod claude;
mod session;
mod title;

pub use claude::{AssistantRequest, AssistantRunner, ClaudeRunner};
pub use session::{encode_workspace_path, find_session, project_dir};
pub use title::{generate_title, truncate_title, MAX_TITLE_LEN};
