pub mod fingerprint;
pub mod page;
pub mod remote;
pub mod user_agent;

pub use fingerprint::{Fingerprint, FingerprintManager};
pub use page::PageHandle;
pub use remote::{RemoteBrowserService, RenderedContent, Renderer};
pub use user_agent::UserAgentPool;
