/// What to do with symlink targets that leave the destination tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SymlinkPolicy {
    /// Create every symlink exactly as archived, as `tar` does.
    #[default]
    Verbatim,
    /// Fail with [`crate::Error::SymlinkEscape`] on absolute targets and on
    /// relative targets that climb above the destination directory.
    RejectEscaping,
}

/// Settings for a single extraction call.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    pub preserve_permissions: bool,
    pub preserve_mtime: bool,
    pub overwrite: bool,
    pub symlink_policy: SymlinkPolicy,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            preserve_permissions: true,
            preserve_mtime: true,
            overwrite: true,
            symlink_policy: SymlinkPolicy::default(),
        }
    }
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = preserve;
        self
    }

    pub fn preserve_mtime(mut self, preserve: bool) -> Self {
        self.preserve_mtime = preserve;
        self
    }

    /// Replace existing non-directories in the destination. When off, any
    /// pre-existing file, symlink or hardlink at a target path is an error.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn symlink_policy(mut self, policy: SymlinkPolicy) -> Self {
        self.symlink_policy = policy;
        self
    }
}
