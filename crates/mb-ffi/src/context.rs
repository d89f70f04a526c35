//! Family-generic lifecycle behind the C handles.
//!
//! Each C handle holds one nullable pointer to a boxed buf wrapping a live
//! [`ModelHandle`]. A null pointer is an empty handle. `init` only writes
//! the pointer after a successful load and `uninit` always leaves it null.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;

use mb_model::{Gpt2, Magika, ModelError, ModelFamily, ModelHandle, Yolo};

use crate::error::invalid_argument;
use crate::types::{MbGpt2ModelBuf, MbGraphDesc, MbMagikaModelBuf, MbStatus, MbYoloModelBuf};

type Handle<B> = ModelHandle<<B as ModelBuf>::Family>;

/// Opaque storage of one loaded model of a family.
pub(crate) trait ModelBuf: Sized {
    type Family: ModelFamily;

    fn wrap(handle: Handle<Self>) -> Self;
    fn handle(&mut self) -> &mut Handle<Self>;
}

impl ModelBuf for MbGpt2ModelBuf {
    type Family = Gpt2;

    fn wrap(handle: ModelHandle<Gpt2>) -> Self {
        MbGpt2ModelBuf { handle }
    }

    fn handle(&mut self) -> &mut ModelHandle<Gpt2> {
        &mut self.handle
    }
}

impl ModelBuf for MbMagikaModelBuf {
    type Family = Magika;

    fn wrap(handle: ModelHandle<Magika>) -> Self {
        MbMagikaModelBuf { handle }
    }

    fn handle(&mut self) -> &mut ModelHandle<Magika> {
        &mut self.handle
    }
}

impl ModelBuf for MbYoloModelBuf {
    type Family = Yolo;

    fn wrap(handle: ModelHandle<Yolo>) -> Self {
        MbYoloModelBuf { handle }
    }

    fn handle(&mut self) -> &mut ModelHandle<Yolo> {
        &mut self.handle
    }
}

/// Borrow a C path argument.
///
/// # Safety
/// `fname` must be null or point to a NUL-terminated string that outlives
/// the returned path.
pub(crate) unsafe fn path_arg<'a>(fname: *const c_char) -> Result<&'a Path, MbStatus> {
    if fname.is_null() {
        return Err(invalid_argument("fname is null"));
    }
    match unsafe { CStr::from_ptr(fname) }.to_str() {
        Ok(s) => Ok(Path::new(s)),
        Err(e) => Err(invalid_argument(&format!("invalid path: {}", e))),
    }
}

/// Load the model at `path` into `slot`.
pub(crate) fn init<B: ModelBuf>(
    slot: &mut *mut B,
    path: &Path,
    params: &<B::Family as ModelFamily>::Params,
) -> Result<(), ModelError> {
    if !slot.is_null() {
        return Err(ModelError::AlreadyInitialized(B::Family::NAME));
    }
    let handle = ModelHandle::open(path, params)?;
    *slot = Box::into_raw(Box::new(B::wrap(handle)));
    Ok(())
}

/// Release the model in `slot`, leaving it null.
///
/// # Safety
/// `*slot` must be null or a pointer produced by [`init`] for the same family.
pub(crate) unsafe fn uninit<B: ModelBuf>(slot: &mut *mut B) {
    let buf = std::mem::replace(slot, ptr::null_mut());
    if !buf.is_null() {
        drop(unsafe { Box::from_raw(buf) });
    }
}

/// Build a fresh graph for the model in `buf` and summarize it.
///
/// # Safety
/// Same as [`uninit`] for `buf`.
pub(crate) unsafe fn graph<B: ModelBuf>(
    buf: *mut B,
    params: &<B::Family as ModelFamily>::GraphParams,
) -> Result<MbGraphDesc, ModelError> {
    let buf = unsafe { buf.as_mut() }.ok_or(ModelError::NotInitialized(B::Family::NAME))?;
    let graph = buf.handle().graph(params)?;
    Ok(MbGraphDesc::describe(&graph))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_model::{fixtures, MagikaParams};

    #[test]
    fn test_slot_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        fixtures::write_magika(&path).unwrap();

        let mut slot: *mut MbMagikaModelBuf = ptr::null_mut();
        assert!(matches!(
            unsafe { graph(slot, &()) },
            Err(ModelError::NotInitialized("magika"))
        ));

        init(&mut slot, &path, &MagikaParams).unwrap();
        assert!(!slot.is_null());
        assert!(unsafe { (*slot).handle().is_live() });

        let live = slot;
        assert!(matches!(
            init(&mut slot, &path, &MagikaParams),
            Err(ModelError::AlreadyInitialized("magika"))
        ));
        assert_eq!(slot, live);

        let desc = unsafe { graph(slot, &()) }.unwrap();
        assert!(desc.n_nodes > 0);

        unsafe { uninit(&mut slot) };
        assert!(slot.is_null());
        unsafe { uninit(&mut slot) };
        assert!(slot.is_null());
    }

    #[test]
    fn test_failed_init_leaves_slot_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot: *mut MbMagikaModelBuf = ptr::null_mut();
        assert!(init(&mut slot, &dir.path().join("missing.gguf"), &MagikaParams).is_err());
        assert!(slot.is_null());
    }
}
