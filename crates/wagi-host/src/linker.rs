//! Registration of the `wasi_experimental_http` host functions.
//!
//! The functions are registered on any [`Linker<T>`] given an accessor that
//! projects the store data onto its [`HttpProxy`], in the same shape as
//! `wasmtime_wasi`'s `add_to_linker` helpers. Every function returns `0` on
//! success and a [`ProxyError`] code otherwise.
//!
//! # Memory Protocol
//!
//! Pointers and lengths arrive as `i32` and are reinterpreted as unsigned
//! offsets into the guest's exported `memory`. Output values are written
//! little-endian: the status code as `u16`, handles and byte counts as `u32`.

use tracing::{debug, trace};
use wasmtime::{AsContextMut, Caller, Extern, Linker, Memory};

use crate::http_outbound::{HttpProxy, ProxyError};

/// Import module name guests link against.
pub const MODULE_NAME: &str = "wasi_experimental_http";

/// Name of the guest memory export the functions operate on.
pub const MEMORY_EXPORT: &str = "memory";

/// Projects store data onto the proxy of the running instance.
///
/// Returning `None` means the instance was not granted outbound HTTP; every
/// call then fails with [`ProxyError::Runtime`].
pub type ProxyAccessor<T> = fn(&mut T) -> Option<&mut HttpProxy>;

/// Register `req`, `header_get`, `headers_get_all`, `body_read` and `close`.
///
/// # Errors
///
/// Returns an error if a function with the same name is already defined.
pub fn add_to_linker<T: 'static>(
    linker: &mut Linker<T>,
    get: ProxyAccessor<T>,
) -> wasmtime::Result<()> {
    linker.func_wrap(
        MODULE_NAME,
        "req",
        move |mut caller: Caller<'_, T>,
              url_ptr: i32,
              url_len: i32,
              method_ptr: i32,
              method_len: i32,
              headers_ptr: i32,
              headers_len: i32,
              body_ptr: i32,
              body_len: i32,
              status_code_ptr: i32,
              handle_ptr: i32|
              -> i32 {
            let args = RequestArgs {
                url: (url_ptr, url_len),
                method: (method_ptr, method_len),
                headers: (headers_ptr, headers_len),
                body: (body_ptr, body_len),
                status_code_ptr,
                handle_ptr,
            };
            status("req", request(&mut caller, get, &args))
        },
    )?;

    linker.func_wrap(
        MODULE_NAME,
        "header_get",
        move |mut caller: Caller<'_, T>,
              handle: i32,
              name_ptr: i32,
              name_len: i32,
              value_ptr: i32,
              value_len: i32,
              value_written_ptr: i32|
              -> i32 {
            let result = header_get(
                &mut caller,
                get,
                handle,
                (name_ptr, name_len),
                (value_ptr, value_len),
                value_written_ptr,
            );
            status("header_get", result)
        },
    )?;

    linker.func_wrap(
        MODULE_NAME,
        "headers_get_all",
        move |mut caller: Caller<'_, T>,
              handle: i32,
              buf_ptr: i32,
              buf_len: i32,
              buf_written_ptr: i32|
              -> i32 {
            let result = headers_get_all(&mut caller, get, handle, (buf_ptr, buf_len), buf_written_ptr);
            status("headers_get_all", result)
        },
    )?;

    linker.func_wrap(
        MODULE_NAME,
        "body_read",
        move |mut caller: Caller<'_, T>,
              handle: i32,
              buf_ptr: i32,
              buf_len: i32,
              buf_written_ptr: i32|
              -> i32 {
            let result = body_read(&mut caller, get, handle, (buf_ptr, buf_len), buf_written_ptr);
            status("body_read", result)
        },
    )?;

    linker.func_wrap(
        MODULE_NAME,
        "close",
        move |mut caller: Caller<'_, T>, handle: i32| -> i32 {
            let result = get(caller.data_mut())
                .ok_or(ProxyError::Runtime)
                .and_then(|proxy| proxy.close(as_handle(handle)));
            status("close", result)
        },
    )?;

    Ok(())
}

/// Pointer/length pair in guest memory.
type Region = (i32, i32);

struct RequestArgs {
    url: Region,
    method: Region,
    headers: Region,
    body: Region,
    status_code_ptr: i32,
    handle_ptr: i32,
}

fn status(function: &str, result: Result<(), ProxyError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            debug!(function = function, error = %e, code = e.code(), "Outbound HTTP call failed");
            e.code()
        }
    }
}

fn request<T>(
    caller: &mut Caller<'_, T>,
    get: ProxyAccessor<T>,
    args: &RequestArgs,
) -> Result<(), ProxyError> {
    let memory = memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller.as_context_mut());

    let url = read_str(data, args.url)?;
    let method = read_str(data, args.method)?;
    let headers = read_str(data, args.headers)?;
    let body = slice(data, args.body)?.to_vec();

    // Validate the output slots before anything is sent.
    slice(data, (args.status_code_ptr, 2))?;
    slice(data, (args.handle_ptr, 4))?;

    let proxy = get(state).ok_or(ProxyError::Runtime)?;
    let (status_code, handle) = proxy.request(&url, &method, &headers, &body)?;

    write_bytes(data, args.status_code_ptr, &status_code.to_le_bytes())?;
    write_bytes(data, args.handle_ptr, &handle.to_le_bytes())?;
    trace!(handle = handle, status = status_code, "req created handle");
    Ok(())
}

fn header_get<T>(
    caller: &mut Caller<'_, T>,
    get: ProxyAccessor<T>,
    handle: i32,
    name: Region,
    value: Region,
    value_written_ptr: i32,
) -> Result<(), ProxyError> {
    let memory = memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller.as_context_mut());

    let name = read_str(data, name)?;
    let proxy = get(state).ok_or(ProxyError::Runtime)?;
    let header = proxy.header_get(as_handle(handle), &name)?;

    write_sized(data, value, header.as_bytes(), value_written_ptr)
}

fn headers_get_all<T>(
    caller: &mut Caller<'_, T>,
    get: ProxyAccessor<T>,
    handle: i32,
    buf: Region,
    buf_written_ptr: i32,
) -> Result<(), ProxyError> {
    let memory = memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller.as_context_mut());

    let proxy = get(state).ok_or(ProxyError::Runtime)?;
    let headers = proxy.headers_get_all(as_handle(handle))?;

    write_sized(data, buf, headers.as_bytes(), buf_written_ptr)
}

fn body_read<T>(
    caller: &mut Caller<'_, T>,
    get: ProxyAccessor<T>,
    handle: i32,
    buf: Region,
    buf_written_ptr: i32,
) -> Result<(), ProxyError> {
    let memory = memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller.as_context_mut());

    let capacity = slice(data, buf)?.len();
    slice(data, (buf_written_ptr, 4))?;

    let proxy = get(state).ok_or(ProxyError::Runtime)?;
    let chunk = proxy.body_read(as_handle(handle), capacity)?;

    write_bytes(data, buf.0, chunk)?;
    let written = u32::try_from(chunk.len()).map_err(|_| ProxyError::Runtime)?;
    write_bytes(data, buf_written_ptr, &written.to_le_bytes())
}

fn memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory, ProxyError> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or(ProxyError::MemoryNotFound)
}

#[allow(clippy::cast_sign_loss)]
const fn as_handle(handle: i32) -> u32 {
    handle as u32
}

#[allow(clippy::cast_sign_loss)]
fn range(data_len: usize, (ptr, len): Region) -> Result<std::ops::Range<usize>, ProxyError> {
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or(ProxyError::MemoryAccess)?;

    if end > data_len {
        trace!(start = start, end = end, memory_size = data_len, "Memory access out of bounds");
        return Err(ProxyError::MemoryAccess);
    }
    Ok(start..end)
}

fn slice(data: &[u8], region: Region) -> Result<&[u8], ProxyError> {
    let range = range(data.len(), region)?;
    Ok(&data[range])
}

fn read_str(data: &[u8], region: Region) -> Result<String, ProxyError> {
    std::str::from_utf8(slice(data, region)?)
        .map(str::to_owned)
        .map_err(|_| ProxyError::Utf8)
}

fn write_bytes(data: &mut [u8], ptr: i32, bytes: &[u8]) -> Result<(), ProxyError> {
    let len = i32::try_from(bytes.len()).map_err(|_| ProxyError::MemoryAccess)?;
    let range = range(data.len(), (ptr, len))?;
    data[range].copy_from_slice(bytes);
    Ok(())
}

/// Write `bytes` into a caller buffer and record the count written.
fn write_sized(
    data: &mut [u8],
    buf: Region,
    bytes: &[u8],
    written_ptr: i32,
) -> Result<(), ProxyError> {
    let capacity = slice(data, buf)?.len();
    if bytes.len() > capacity {
        trace!(needed = bytes.len(), capacity = capacity, "Guest buffer too small");
        return Err(ProxyError::BufferTooSmall);
    }

    let written = u32::try_from(bytes.len()).map_err(|_| ProxyError::Runtime)?;
    write_bytes(data, buf.0, bytes)?;
    write_bytes(data, written_ptr, &written.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Permissions;
    use wasmtime::{Engine, Module, Store};

    struct Ctx {
        http: Option<HttpProxy>,
    }

    fn ctx(hosts: &[&str]) -> Ctx {
        let perms = Permissions::builder().allow_uris(hosts.iter().copied()).build();
        Ctx {
            http: Some(HttpProxy::new(reqwest::Client::new(), perms)),
        }
    }

    const REQ_GUEST: &str = r#"
        (module
            (import "wasi_experimental_http" "req"
                (func $req (param i32 i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
            (import "wasi_experimental_http" "close"
                (func $close (param i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "https://blocked.example.com/")
            (data (i32.const 64) "GET")
            (func (export "call_req") (result i32)
                (call $req
                    (i32.const 0) (i32.const 28)
                    (i32.const 64) (i32.const 3)
                    (i32.const 0) (i32.const 0)
                    (i32.const 0) (i32.const 0)
                    (i32.const 128) (i32.const 132)))
            (func (export "call_req_oob") (result i32)
                (call $req
                    (i32.const 65530) (i32.const 100)
                    (i32.const 64) (i32.const 3)
                    (i32.const 0) (i32.const 0)
                    (i32.const 0) (i32.const 0)
                    (i32.const 128) (i32.const 132)))
            (func (export "call_close") (result i32)
                (call $close (i32.const 42)))
        )
    "#;

    fn call(ctx: Ctx, wat: &str, export: &str) -> i32 {
        let engine = Engine::default();
        let mut linker = Linker::new(&engine);
        add_to_linker(&mut linker, |c: &mut Ctx| c.http.as_mut()).unwrap();

        let module = Module::new(&engine, wat).unwrap();
        let mut store = Store::new(&engine, ctx);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let func = instance
            .get_typed_func::<(), i32>(&mut store, export)
            .unwrap();
        func.call(&mut store, ()).unwrap()
    }

    #[test]
    fn test_register() {
        let engine = Engine::default();
        let mut linker: Linker<Ctx> = Linker::new(&engine);
        assert!(add_to_linker(&mut linker, |c| c.http.as_mut()).is_ok());
        // Registering twice is a duplicate definition
        assert!(add_to_linker(&mut linker, |c| c.http.as_mut()).is_err());
    }

    #[test]
    fn test_req_destination_not_allowed() {
        let code = call(ctx(&["https://allowed.example.com"]), REQ_GUEST, "call_req");
        assert_eq!(code, ProxyError::DestinationNotAllowed.code());
    }

    #[test]
    fn test_req_out_of_bounds() {
        let code = call(ctx(&[]), REQ_GUEST, "call_req_oob");
        assert_eq!(code, ProxyError::MemoryAccess.code());
    }

    #[test]
    fn test_close_invalid_handle() {
        let code = call(ctx(&[]), REQ_GUEST, "call_close");
        assert_eq!(code, ProxyError::InvalidHandle.code());
    }

    #[test]
    fn test_no_proxy_is_runtime_error() {
        let code = call(Ctx { http: None }, REQ_GUEST, "call_req");
        assert_eq!(code, ProxyError::Runtime.code());
    }

    #[test]
    fn test_memory_not_found() {
        let wat = r#"
            (module
                (import "wasi_experimental_http" "body_read"
                    (func $body_read (param i32 i32 i32 i32) (result i32)))
                (func (export "run") (result i32)
                    (call $body_read (i32.const 1) (i32.const 0) (i32.const 0) (i32.const 0)))
            )
        "#;
        let code = call(ctx(&[]), wat, "run");
        assert_eq!(code, ProxyError::MemoryNotFound.code());
    }

    #[test]
    fn test_range_checks() {
        assert_eq!(range(16, (0, 16)).unwrap(), 0..16);
        assert_eq!(range(16, (8, 9)), Err(ProxyError::MemoryAccess));
        assert_eq!(range(16, (-1, 1)), Err(ProxyError::MemoryAccess));
    }
}
