use crate::error::Result;
use std::os::unix::fs::PermissionsExt as _;

/// Makes the file executable by everyone who can read it.
pub(crate) fn make_executable(file: &std::fs::File) -> Result {
    let metadata = file.metadata()?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    // Copy each read bit to the corresponding execute bit.
    permissions.set_mode(mode | ((mode & 0o444) >> 2));
    file.set_permissions(permissions)?;
    Ok(())
}
