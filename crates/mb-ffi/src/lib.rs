//! C ABI for model-bind.
//!
//! Each model family gets an `init` / `uninit` / `graph` triple over a
//! `#[repr(C)]` handle holding one opaque pointer. Every fallible function
//! returns an [`MbStatus`]; on failure the message is available from
//! [`mb_last_error`] on the same thread.

mod context;
mod error;
mod types;

pub use error::*;
pub use types::*;

use std::ffi::CString;
use std::os::raw::{c_char, c_int};

use mb_model::{Gpt2GraphParams, Gpt2Params, MagikaParams, YoloParams};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, checked before `RUST_LOG`.
const LOG_ENV: &str = "MB_LOG";

fn non_negative(value: c_int, what: &str) -> Result<usize, MbStatus> {
    usize::try_from(value).map_err(|_| invalid_argument(&format!("{} must be non-negative", what)))
}

/// Load a GPT-2 model in the legacy GGML format.
///
/// `n_ctx` of 0 keeps the model's trained context. Any `n_gpu_layers` above 0
/// requests the Metal backend, falling back to CPU when unavailable.
///
/// # Safety
/// `model` must be null or point to a handle that is zeroed or was filled by
/// this library; `fname` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mb_gpt2_model_init(
    model: *mut MbGpt2Model,
    fname: *const c_char,
    n_ctx: c_int,
    n_gpu_layers: c_int,
) -> MbStatus {
    catch_panic(|| {
        let Some(model) = (unsafe { model.as_mut() }) else {
            return invalid_argument("model is null");
        };
        let path = match unsafe { context::path_arg(fname) } {
            Ok(p) => p,
            Err(status) => return status,
        };
        let params = match (non_negative(n_ctx, "n_ctx"), non_negative(n_gpu_layers, "n_gpu_layers")) {
            (Ok(n_ctx), Ok(n_gpu_layers)) => Gpt2Params {
                n_ctx,
                n_gpu_layers,
            },
            (Err(status), _) | (_, Err(status)) => return status,
        };
        match context::init(&mut model.buf, path, &params) {
            Ok(()) => MbStatus::Ok,
            Err(e) => fail(e, MbStatus::ErrorModelLoad),
        }
    })
}

/// Release a GPT-2 model. A no-op on a null or empty handle.
///
/// # Safety
/// Same as [`mb_gpt2_model_init`] for `model`.
#[no_mangle]
pub unsafe extern "C" fn mb_gpt2_model_uninit(model: *mut MbGpt2Model) {
    if let Some(model) = unsafe { model.as_mut() } {
        unsafe { context::uninit(&mut model.buf) };
    }
}

/// Build the GPT-2 graph for `n_tokens` new tokens after `n_past` cached ones
/// and write its summary into `*out`.
///
/// # Safety
/// Same as [`mb_gpt2_model_init`] for `model`; `out` must be null or valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn mb_gpt2_model_graph(
    model: *mut MbGpt2Model,
    n_past: c_int,
    n_tokens: c_int,
    out: *mut MbGraphDesc,
) -> MbStatus {
    catch_panic(|| {
        let (Some(model), Some(out)) = (unsafe { model.as_ref() }, unsafe { out.as_mut() }) else {
            return invalid_argument("null argument");
        };
        let params = match (non_negative(n_past, "n_past"), non_negative(n_tokens, "n_tokens")) {
            (Ok(n_past), Ok(n_tokens)) => Gpt2GraphParams { n_past, n_tokens },
            (Err(status), _) | (_, Err(status)) => return status,
        };
        match unsafe { context::graph(model.buf, &params) } {
            Ok(desc) => {
                *out = desc;
                MbStatus::Ok
            }
            Err(e) => fail(e, MbStatus::ErrorGraph),
        }
    })
}

/// Load a Magika file-type classifier from a GGUF file.
///
/// # Safety
/// `model` must be null or point to a handle that is zeroed or was filled by
/// this library; `fname` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mb_magika_model_init(
    model: *mut MbMagikaModel,
    fname: *const c_char,
) -> MbStatus {
    catch_panic(|| {
        let Some(model) = (unsafe { model.as_mut() }) else {
            return invalid_argument("model is null");
        };
        let path = match unsafe { context::path_arg(fname) } {
            Ok(p) => p,
            Err(status) => return status,
        };
        match context::init(&mut model.buf, path, &MagikaParams) {
            Ok(()) => MbStatus::Ok,
            Err(e) => fail(e, MbStatus::ErrorModelLoad),
        }
    })
}

/// Release a Magika model. A no-op on a null or empty handle.
///
/// # Safety
/// Same as [`mb_magika_model_init`] for `model`.
#[no_mangle]
pub unsafe extern "C" fn mb_magika_model_uninit(model: *mut MbMagikaModel) {
    if let Some(model) = unsafe { model.as_mut() } {
        unsafe { context::uninit(&mut model.buf) };
    }
}

/// Build the classifier graph and write its summary into `*out`.
///
/// # Safety
/// Same as [`mb_magika_model_init`] for `model`; `out` must be null or valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn mb_magika_model_graph(
    model: *mut MbMagikaModel,
    out: *mut MbGraphDesc,
) -> MbStatus {
    catch_panic(|| {
        let (Some(model), Some(out)) = (unsafe { model.as_ref() }, unsafe { out.as_mut() }) else {
            return invalid_argument("null argument");
        };
        match unsafe { context::graph(model.buf, &()) } {
            Ok(desc) => {
                *out = desc;
                MbStatus::Ok
            }
            Err(e) => fail(e, MbStatus::ErrorGraph),
        }
    })
}

/// Load a YOLOv3-tiny detector from a GGUF file onto the CPU backend.
///
/// # Safety
/// `model` must be null or point to a handle that is zeroed or was filled by
/// this library; `fname` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mb_yolo_model_init(
    model: *mut MbYoloModel,
    fname: *const c_char,
) -> MbStatus {
    catch_panic(|| {
        let Some(model) = (unsafe { model.as_mut() }) else {
            return invalid_argument("model is null");
        };
        let path = match unsafe { context::path_arg(fname) } {
            Ok(p) => p,
            Err(status) => return status,
        };
        match context::init(&mut model.buf, path, &YoloParams::default()) {
            Ok(()) => MbStatus::Ok,
            Err(e) => fail(e, MbStatus::ErrorModelLoad),
        }
    })
}

/// Release a YOLO model and its graph arena. A no-op on a null or empty handle.
///
/// # Safety
/// Same as [`mb_yolo_model_init`] for `model`.
#[no_mangle]
pub unsafe extern "C" fn mb_yolo_model_uninit(model: *mut MbYoloModel) {
    if let Some(model) = unsafe { model.as_mut() } {
        unsafe { context::uninit(&mut model.buf) };
    }
}

/// Build the detector graph in the model's arena and write its summary
/// into `*out`.
///
/// # Safety
/// Same as [`mb_yolo_model_init`] for `model`; `out` must be null or valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn mb_yolo_model_graph(
    model: *mut MbYoloModel,
    out: *mut MbGraphDesc,
) -> MbStatus {
    catch_panic(|| {
        let (Some(model), Some(out)) = (unsafe { model.as_ref() }, unsafe { out.as_mut() }) else {
            return invalid_argument("null argument");
        };
        match unsafe { context::graph(model.buf, &()) } {
            Ok(desc) => {
                *out = desc;
                MbStatus::Ok
            }
            Err(e) => fail(e, MbStatus::ErrorGraph),
        }
    })
}

/// Install a stderr log subscriber filtered by `MB_LOG`, then `RUST_LOG`,
/// defaulting to `info`. Calling it again is harmless.
#[no_mangle]
pub extern "C" fn mb_log_init() -> MbStatus {
    catch_panic(|| {
        if tracing::dispatcher::has_been_set() {
            return MbStatus::Ok;
        }
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));
        // Losing a race with another initializer is fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .try_init();
        MbStatus::Ok
    })
}

/// Retrieve the last error message.
///
/// Returns a pointer to a C string describing the most recent error on this
/// thread, or null if there is none. The caller must free the returned string
/// with `mb_free_string`.
#[no_mangle]
pub extern "C" fn mb_last_error() -> *mut c_char {
    match take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null_mut(),
    }
}

/// Free a string previously returned by `mb_last_error`.
///
/// # Safety
/// `s` must be null or a pointer returned by `mb_last_error` that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn mb_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_model::fixtures;
    use std::ffi::CStr;
    use std::path::Path;
    use std::ptr;

    fn c_path(path: &Path) -> CString {
        CString::new(path.to_str().unwrap()).unwrap()
    }

    fn last_error() -> String {
        let s = mb_last_error();
        assert!(!s.is_null());
        let msg = unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned();
        unsafe { mb_free_string(s) };
        msg
    }

    #[test]
    fn test_gpt2_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpt2.bin");
        let hp = fixtures::tiny_gpt2_hparams();
        fixtures::write_gpt2(&path, &hp, false).unwrap();
        let fname = c_path(&path);

        let mut model = MbGpt2Model::default();
        let status = unsafe { mb_gpt2_model_init(&mut model, fname.as_ptr(), 1024, 0) };
        assert_eq!(status, MbStatus::Ok);
        assert!(!model.buf.is_null());

        let mut desc = MbGraphDesc::default();
        let status = unsafe { mb_gpt2_model_graph(&mut model, 5, 1, &mut desc) };
        assert_eq!(status, MbStatus::Ok);
        assert_eq!(desc.n_inputs, 2);
        assert_eq!(desc.n_outputs, 1);
        assert_eq!(desc.input_ne, [1, 1, 1, 1]);
        assert_eq!(desc.output_ne, [hp.n_vocab as i64, 1, 1, 1]);
        assert!(desc.n_nodes > 0);
        assert!(desc.mem_used > 0);

        unsafe { mb_gpt2_model_uninit(&mut model) };
        assert!(model.buf.is_null());
    }

    #[test]
    fn test_gpt2_rejects_bad_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpt2.bin");
        fixtures::write_gpt2(&path, &fixtures::tiny_gpt2_hparams(), true).unwrap();
        let fname = c_path(&path);

        let mut model = MbGpt2Model::default();
        let status = unsafe { mb_gpt2_model_init(&mut model, fname.as_ptr(), -1, 0) };
        assert_eq!(status, MbStatus::ErrorInvalidArgument);
        assert!(last_error().contains("n_ctx"));
        assert!(model.buf.is_null());

        let status = unsafe { mb_gpt2_model_init(&mut model, ptr::null(), 0, 0) };
        assert_eq!(status, MbStatus::ErrorInvalidArgument);
        let status = unsafe { mb_gpt2_model_init(ptr::null_mut(), fname.as_ptr(), 0, 0) };
        assert_eq!(status, MbStatus::ErrorInvalidArgument);

        let status = unsafe { mb_gpt2_model_init(&mut model, fname.as_ptr(), 0, 0) };
        assert_eq!(status, MbStatus::Ok);

        // Past the end of the key/value memory.
        let mut desc = MbGraphDesc::default();
        let status = unsafe { mb_gpt2_model_graph(&mut model, 16, 1, &mut desc) };
        assert_eq!(status, MbStatus::ErrorInvalidArgument);
        assert_eq!(desc, MbGraphDesc::default());
        let status = unsafe { mb_gpt2_model_graph(&mut model, 0, 1, ptr::null_mut()) };
        assert_eq!(status, MbStatus::ErrorInvalidArgument);

        unsafe { mb_gpt2_model_uninit(&mut model) };
    }

    #[test]
    fn test_magika_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        fixtures::write_magika(&path).unwrap();
        let fname = c_path(&path);

        let mut model = MbMagikaModel::default();
        let status = unsafe { mb_magika_model_init(&mut model, fname.as_ptr()) };
        assert_eq!(status, MbStatus::Ok);

        let mut desc = MbGraphDesc::default();
        let status = unsafe { mb_magika_model_graph(&mut model, &mut desc) };
        assert_eq!(status, MbStatus::Ok);
        assert_eq!(desc.n_inputs, 1);
        assert_eq!(desc.input_ne, [257, 1536, 1, 1]);
        assert_eq!(desc.output_ne, [fixtures::MAGIKA_N_LABEL as i64, 1, 1, 1]);

        unsafe { mb_magika_model_uninit(&mut model) };
        assert!(model.buf.is_null());
    }

    #[test]
    fn test_yolo_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yolo.gguf");
        fixtures::write_yolo(&path, Some((32, 32))).unwrap();
        let fname = c_path(&path);

        let mut model = MbYoloModel::default();
        let status = unsafe { mb_yolo_model_init(&mut model, fname.as_ptr()) };
        assert_eq!(status, MbStatus::Ok);

        let mut first = MbGraphDesc::default();
        let mut second = MbGraphDesc::default();
        assert_eq!(unsafe { mb_yolo_model_graph(&mut model, &mut first) }, MbStatus::Ok);
        assert_eq!(unsafe { mb_yolo_model_graph(&mut model, &mut second) }, MbStatus::Ok);
        assert_eq!(first, second);
        assert_eq!(first.n_outputs, 2);
        assert_eq!(first.input_ne, [32, 32, 3, 1]);
        assert_eq!(
            first.output_ne,
            [1, 1, fixtures::YOLO_HEAD_CHANNELS as i64, 1]
        );

        unsafe { mb_yolo_model_uninit(&mut model) };
        assert!(model.buf.is_null());
    }

    #[test]
    fn test_lifecycle_misuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        fixtures::write_magika(&path).unwrap();
        let fname = c_path(&path);
        let mut desc = MbGraphDesc::default();

        let mut model = MbMagikaModel::default();
        assert_eq!(
            unsafe { mb_magika_model_graph(&mut model, &mut desc) },
            MbStatus::ErrorNotInitialized
        );
        assert!(last_error().contains("not initialized"));

        assert_eq!(unsafe { mb_magika_model_init(&mut model, fname.as_ptr()) }, MbStatus::Ok);
        let live = model.buf;
        assert_eq!(
            unsafe { mb_magika_model_init(&mut model, fname.as_ptr()) },
            MbStatus::ErrorAlreadyInitialized
        );
        assert_eq!(model.buf, live);

        unsafe { mb_magika_model_uninit(&mut model) };
        unsafe { mb_magika_model_uninit(&mut model) };
        unsafe { mb_magika_model_uninit(ptr::null_mut()) };
        assert!(model.buf.is_null());
    }

    #[test]
    fn test_bad_files_leave_handle_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = c_path(&dir.path().join("missing.gguf"));
        let corrupt_path = dir.path().join("corrupt.gguf");
        std::fs::write(&corrupt_path, b"GGUF\x09\x00\x00\x00").unwrap();
        let corrupt = c_path(&corrupt_path);

        let mut yolo = MbYoloModel::default();
        assert_eq!(
            unsafe { mb_yolo_model_init(&mut yolo, missing.as_ptr()) },
            MbStatus::ErrorModelLoad
        );
        assert!(yolo.buf.is_null());
        assert_eq!(
            unsafe { mb_yolo_model_init(&mut yolo, corrupt.as_ptr()) },
            MbStatus::ErrorModelLoad
        );
        assert!(yolo.buf.is_null());
        assert!(last_error().contains("version"));

        let mut gpt2 = MbGpt2Model::default();
        assert_eq!(
            unsafe { mb_gpt2_model_init(&mut gpt2, corrupt.as_ptr(), 0, 0) },
            MbStatus::ErrorModelLoad
        );
        assert!(gpt2.buf.is_null());
    }

    #[test]
    fn test_last_error_empty_is_null() {
        let _ = take_last_error();
        assert!(mb_last_error().is_null());
        unsafe { mb_free_string(ptr::null_mut()) };
    }

    #[test]
    fn test_log_init_is_idempotent() {
        assert_eq!(mb_log_init(), MbStatus::Ok);
        assert_eq!(mb_log_init(), MbStatus::Ok);
    }
}
