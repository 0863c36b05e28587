use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::mem;
use std::panic;
use std::thread;

pub type Error = Box<dyn std::error::Error + 'static>;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// An opaque handle passed across the C boundary for a boxed Rust object.
pub trait ForeignObject: Sized {
    type RustObject;

    #[inline]
    unsafe fn from_rust(object: Self::RustObject) -> *mut Self {
        Box::into_raw(Box::new(object)) as *mut Self
    }

    #[inline]
    #[allow(clippy::wrong_self_convention)]
    unsafe fn as_rust<'a>(pointer: *const Self) -> &'a Self::RustObject {
        &*(pointer as *const Self::RustObject)
    }

    #[inline]
    #[allow(clippy::wrong_self_convention)]
    unsafe fn as_rust_mut<'a>(pointer: *mut Self) -> &'a mut Self::RustObject {
        &mut *(pointer as *mut Self::RustObject)
    }

    #[inline]
    #[allow(clippy::wrong_self_convention)]
    unsafe fn into_rust(pointer: *mut Self) -> Box<Self::RustObject> {
        Box::from_raw(pointer as *mut Self::RustObject)
    }

    #[inline]
    unsafe fn drop(pointer: *mut Self) {
        if !pointer.is_null() {
            drop(Self::into_rust(pointer));
        }
    }
}

/// An error recorded by `landingpad` in place of panics.
#[derive(Debug, thiserror::Error)]
#[error("symbolic panicked: {message}")]
pub struct Panic {
    message: String,
    stack: String,
}

impl Panic {
    /// Creates a panic error and captures the current backtrace.
    pub fn new(message: String) -> Self {
        Panic {
            message,
            stack: Backtrace::force_capture().to_string(),
        }
    }

    /// The backtrace of the panicking thread.
    pub fn backtrace(&self) -> &str {
        &self.stack
    }
}

/// An error raised for null pointers passed where a value is required.
#[derive(Debug, thiserror::Error)]
#[error("unexpected null pointer for {0}")]
pub struct NullPointer(pub &'static str);

pub fn set_last_error(err: Error) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(err));
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Calls `f` with the error recorded last on this thread.
pub fn with_last_error<R>(f: impl FnOnce(Option<&(dyn std::error::Error + 'static)>) -> R) -> R {
    LAST_ERROR.with(|e| f(e.borrow().as_deref()))
}

/// Records panics as the last error instead of printing them.
pub unsafe fn set_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let thread = thread::current();
        let thread = thread.name().unwrap_or("unnamed");

        let message = match info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &**s,
                None => "Box<Any>",
            },
        };

        let description = match info.location() {
            Some(location) => format!(
                "thread '{thread}' panicked with '{message}' at {}:{}",
                location.file(),
                location.line()
            ),
            None => format!("thread '{thread}' panicked with '{message}'"),
        };

        set_last_error(Panic::new(description).into())
    }));
}

/// Runs `f` and moves its error into the last-error slot.
///
/// On error or panic, the zero value of `T` is returned: a null pointer, `0`, `false`, or an
/// empty string.
pub unsafe fn landingpad<F, T>(f: F) -> T
where
    F: FnOnce() -> Result<T, Error> + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            set_last_error(err);
            mem::zeroed()
        }
        Err(_) => mem::zeroed(),
    }
}

/// Reads a required pointer argument.
pub unsafe fn require<'a, T>(pointer: *const T, name: &'static str) -> Result<&'a T, Error> {
    pointer.as_ref().ok_or_else(|| NullPointer(name).into())
}

macro_rules! ffi_fn {
    // a function that catches panics and returns a result (err goes to tls)
    (
        $(#[$attr:meta])*
        unsafe fn $name:ident($($aname:ident: $aty:ty),* $(,)*) -> Result<$rv:ty> $body:block
    ) => {
        #[no_mangle]
        $(#[$attr])*
        pub unsafe extern "C" fn $name($($aname: $aty,)*) -> $rv {
            $crate::utils::landingpad(|| $body)
        }
    };

    // a function that catches panics and returns nothing (err goes to tls)
    (
        $(#[$attr:meta])*
        unsafe fn $name:ident($($aname:ident: $aty:ty),* $(,)*) $body:block
    ) => {
        #[no_mangle]
        $(#[$attr])*
        pub unsafe extern "C" fn $name($($aname: $aty,)*) {
            $crate::utils::landingpad(|| { $body; Ok(0 as std::os::raw::c_int) });
        }
    };
}
