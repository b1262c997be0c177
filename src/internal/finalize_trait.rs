use crate::{gcref::ObjectRef, header::Header};

pub type DestroyCallback = unsafe fn(Header, ObjectRef);

/// Destruction policy run by the sweeper on every unreachable object
/// before its storage is released.
pub trait Policy: 'static {
    /// # Safety
    /// `object` must be unreachable and is never touched again afterwards.
    unsafe fn destroy(header: Header, object: ObjectRef);
}
