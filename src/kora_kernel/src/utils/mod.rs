mod init;
mod prio_bitmap;
mod rawcell;

pub use self::init::Init;
pub(crate) use self::{prio_bitmap::PrioBitmap, rawcell::RawCell};
