use thiserror::Error;

/// Hook errors.
///
/// Every fallible operation reports its failure through this closed set;
/// nothing in the crate panics on a hooking failure. A failed [`install`]
/// leaves the hook uninstalled with the target untouched, a failed
/// [`remove`] leaves it installed.
///
/// [`install`]: crate::Hook::install
/// [`remove`]: crate::Hook::remove
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HookError {
    /// `install` was called on an already installed hook
    #[error("hook is already installed")]
    AlreadyInstalled,

    /// `remove` was called on a hook that is not installed
    #[error("hook is already removed")]
    AlreadyRemoved,

    /// The target's page has no execute permission
    #[error("target memory is not executable")]
    NotExecutable,

    /// Changing memory protection failed, carries the OS error code
    #[error("memory protect error, code:{0}")]
    ProtectViolation(u32),

    /// The resolved prologue is smaller than a near jump
    #[error("not enough space to place the jump patch")]
    NotEnoughSpace,

    /// The target address is null or otherwise unusable
    #[error("invalid target address")]
    InvalidAddress,

    /// Snapshotting bytes (target prologue or codecave entry) failed
    #[error("backup creation failed")]
    BackupCreating,

    /// Restoring the original prologue bytes failed
    #[error("backup restoration failed")]
    BackupRestoring,

    /// No executable block could be allocated near the target
    #[error("codecave allocation failed")]
    AllocateCodecave,

    /// Releasing the codecave back to the OS failed
    #[error("codecave deallocation failed")]
    DeallocateCodecave,

    /// Patching the target bytes failed
    #[error("write to target memory failed")]
    WriteMemory,

    /// Neutralizing the codecave entry jump while parking failed
    #[error("usercode jump removal failed")]
    UsercodeJumpRemove,

    /// Restoring the codecave entry jump on reinstall failed
    #[error("hook reinstallation failed")]
    ReinstallHook,

    /// The moved prologue could not be re-encoded at the codecave address
    #[error("prologue relocation failed")]
    RelocatePrologue,

    /// The signature needs more argument registers than the ABI provides
    /// once the hook identity argument is inserted
    #[error("unsupported signature for this ABI")]
    UnsupportedSignature,
}
