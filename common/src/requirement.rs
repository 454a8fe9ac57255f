use bitflags::bitflags;

bitflags! {
    /// Metadata fields a caller needs populated on the records it refines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldRequirement: u32 {
        const VERSION = 1;
        const LICENSE = 1 << 1;
        const URL = 1 << 2;
        const SIZE = 1 << 3;
        const UPDATE_DETAILS = 1 << 4;
        const UPDATE_SEVERITY = 1 << 5;
        const ORIGIN = 1 << 6;
        const HISTORY = 1 << 7;
        const SETUP_ACTION = 1 << 8;
        const RELATED = 1 << 9;
        const UPGRADE_REMOVED = 1 << 10;
        const PACKAGE_ID = 1 << 11;
        const DESCRIPTION = 1 << 12;
    }
}

impl FieldRequirement {
    /// Fields that can only be looked up once the package id is known.
    pub const NEEDS_PACKAGE_ID: FieldRequirement = FieldRequirement::VERSION
        .union(FieldRequirement::LICENSE)
        .union(FieldRequirement::URL)
        .union(FieldRequirement::SIZE)
        .union(FieldRequirement::DESCRIPTION)
        .union(FieldRequirement::UPDATE_DETAILS)
        .union(FieldRequirement::ORIGIN)
        .union(FieldRequirement::SETUP_ACTION)
        .union(FieldRequirement::PACKAGE_ID);

    /// Fields served by a single get-details lookup.
    pub const DETAILS: FieldRequirement = FieldRequirement::LICENSE
        .union(FieldRequirement::URL)
        .union(FieldRequirement::SIZE)
        .union(FieldRequirement::DESCRIPTION);

    /// Whether satisfying this requirement first needs package ids resolved.
    pub fn requires_package_id(self) -> bool {
        self.intersects(Self::NEEDS_PACKAGE_ID)
    }

    /// The requirement with its implicit dependencies added.
    pub fn implied(self) -> Self {
        if self.requires_package_id() {
            self | Self::PACKAGE_ID
        } else {
            self
        }
    }
}
