pub mod audit_repo;
pub mod job_snapshot_repo;
pub mod quota_repo;
pub mod target_repo;

pub use audit_repo::AuditLogRepo;
pub use job_snapshot_repo::JobSnapshotRepo;
pub use quota_repo::QuotaRepo;
pub use target_repo::TargetEntryRepo;
