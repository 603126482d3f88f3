pub mod api;
pub mod clock;
pub mod service;
pub mod storage;
pub mod token;

pub use api::{AuthApi, HttpAuthApi};
pub use clock::{is_session_valid, Clock, ManualClock, SystemClock};
pub use service::{NavigationDecision, PendingAction, SessionManager, SessionState};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, TokenStore};
pub use token::{decode_identity, Identity, SessionRecord, TokenGrant};
