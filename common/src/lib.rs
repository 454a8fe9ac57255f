mod package_id;
mod record;
mod requirement;

pub use package_id::{INSTALLED_PREFIX, PackageId, PackageIdError, WeakPackageId};
pub use record::{InstallDate, Quirks, Record, RecordKind, Size, State, UrgencyKind};
pub use requirement::FieldRequirement;
