pub mod browser;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod metrics;
pub mod persist;
pub mod realtime;
pub mod rendezvous;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod testing;

pub use browser::{
    prepare_profile, BrowserError, BrowserLauncher, BrowserSession, WebDriverLauncher,
};
pub use clock::{Clock, SystemClock};
pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use diagnostics::DiagnosticLog;
pub use persist::{PersistError, PersistenceWriter};
pub use realtime::{BrowserLiveTable, LiveTableSource, RealtimeError, RealtimeSync};
pub use rendezvous::{
    run_bridge, ArtifactStore, Completion, CompletionWaiter, InterceptError, Interceptor,
};
pub use resolver::{IdentifierResolver, ResolveError, UrlCache};
pub use scheduler::{IngestScheduler, JobStatus, RunReport, SchedulerError};
pub use store::{EntityKey, ObservationStore, RealtimeStore, SqliteStore, StoreError, WatermarkStore};
