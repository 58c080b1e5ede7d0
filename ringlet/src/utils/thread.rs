use anyhow::{Result, anyhow};
use std::ffi::CStr;

const MAX_PTHREAD_NAME_LEN: usize = 16;

// pthread names are limited to 16 bytes including the null terminator, longer
// names are truncated.
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for (dst, src) in c_name_buf.iter_mut().zip(&bytes[..len_to_copy]) {
        *dst = *src as libc::c_char;
    }

    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), c_name_buf.as_ptr());
    }
}

#[allow(unused)]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(
            libc::pthread_self(),
            c_name_buf.as_mut_ptr(),
            MAX_PTHREAD_NAME_LEN,
        )
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    Ok(c_str.to_string_lossy().into_owned())
}
