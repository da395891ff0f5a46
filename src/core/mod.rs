pub mod audit;
pub mod file_state;
pub mod lister;
pub mod merger;
pub mod scanner;
pub mod status;
pub mod supervisor;
pub mod watcher;

pub use audit::{latest_objects, purge_ghosts, PurgeReport};
pub use file_state::{calculate_hash, calculate_quick_hash, FingerprintCache};
pub use lister::RemoteLister;
pub use merger::{sort_entries, SortKey, ViewMerger};
pub use scanner::{LocalScanner, ScanRules};
pub use status::{StatusSummary, StatusTracker};
pub use supervisor::{EventSink, SyncSupervisor};
pub use watcher::{ChangeKind, ChangeWatcher, FsChange};
