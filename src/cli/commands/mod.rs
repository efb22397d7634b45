pub mod run;
pub mod status;

use crate::error::BackupkitError;
use crate::types::ExitCodes;

pub fn exit_for_error(err: &BackupkitError, codes: &ExitCodes) -> ! {
    eprintln!("{}", err);
    std::process::exit(codes.for_error(err));
}
