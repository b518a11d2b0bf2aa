//! # Media Vault Uploads
//!
//! Client-side engine for chunked multipart uploads and best-effort batch
//! object operations against an S3-compatible bucket. Credentials are
//! exchanged for a short-lived session, a trusted broker signs one operation
//! at a time, and bytes travel directly between the client and storage.
//!
//! ## Architecture
//!
//! - **Session**: Exchanges the identity token and admin secret for a session
//!   grant, cached in an explicit [`SessionContext`]
//! - **Broker**: Requests presigned URLs and drives the multipart primitives
//! - **Transport**: Executes presigned URLs against storage
//! - **Upload**: The multipart coordinator and the batch orchestrator
//! - **Progress**: Percentages and status lines for any front end
//! - **Middleware**: Credential headers and input validation
//! - **Models**: Data structures shared by every layer
//!
//! ## Core Features
//!
//! - Multipart uploads in 5 MiB parts with bounded concurrency and retries
//! - Per-item isolation in batch uploads and deletes
//! - Grants are never presented after they expire
//! - Progress published over a watch channel
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use media_vault_uploads::{
//!     broker::{wire, HttpBroker},
//!     config::Config,
//!     models::{BatchItem, Operation, Secret},
//!     session::{HttpSessionAuthority, SessionContext},
//!     transport::HttpTransport,
//!     upload::BatchOrchestrator,
//! };
//!
//! # async fn run() -> media_vault_uploads::errors::AppResult<()> {
//! let config = Config::default();
//! let client = wire::http_client(&config)?;
//! let authority = Arc::new(HttpSessionAuthority::from_config(client.clone(), &config)?);
//! let ctx = SessionContext::new(authority, Secret::new("id-token"), Secret::new("admin"));
//!
//! let broker = Arc::new(HttpBroker::new(client.clone(), &config)?);
//! let transport = Arc::new(HttpTransport::new(client));
//! let batch = BatchOrchestrator::new(broker, transport, config);
//!
//! let items = vec![BatchItem::delete("a.txt"), BatchItem::delete("b.txt")];
//! for result in batch.run_batch(&ctx, Operation::Delete, items, Some(8)).await? {
//!     println!("{} -> {}", result.path, result.success);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod progress;
pub mod retry;
pub mod session;
pub mod transport;
pub mod upload;
pub mod utils;

pub use crate::config::Config;
pub use crate::errors::{AppError, AppResult};
pub use crate::session::SessionContext;
pub use crate::upload::{BatchOrchestrator, MultipartCoordinator, UploadSession};
