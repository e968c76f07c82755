//! Name resolution through `getaddrinfo`.

use std::ffi::{CStr, CString};
use std::{fmt, mem, ptr};

use crate::error::{ResolveError, Result};
use crate::net::endpoint::{Endpoint, Family, SocketType};

/// Resolves `node` (a host name or a numeric address) and an optional
/// `service` (a port number or a service name) into endpoints.
///
/// `family` restricts the result to one family, and `kind` (byte streams if
/// `None`) selects the socket type the endpoints are meant for.
///
/// # Errors
///
/// Returns [crate::Error::Resolution] if the lookup fails.
pub fn resolve(
    node: &str,
    service: Option<&str>,
    family: Option<Family>,
    kind: Option<SocketType>,
) -> Result<AddrInfo> {
    let c_node = to_cstring(node, node)?;
    let c_service = service.map(|s| to_cstring(node, s)).transpose()?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family.map_or(libc::AF_UNSPEC, Family::as_raw);
    hints.ai_socktype = kind.unwrap_or(SocketType::Stream).as_raw();

    let mut head: *mut libc::addrinfo = ptr::null_mut();
    let code = unsafe {
        libc::getaddrinfo(
            c_node.as_ptr(),
            c_service.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            &hints,
            &mut head,
        )
    };

    if code != 0 {
        let os_code = if code == libc::EAI_SYSTEM {
            std::io::Error::last_os_error().raw_os_error()
        } else {
            None
        };
        let message = unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
            .to_string_lossy()
            .into_owned();

        return Err(ResolveError {
            node: node.to_string(),
            code,
            os_code,
            message,
        }
        .into());
    }

    Ok(AddrInfo { head, next: head })
}

fn to_cstring(node: &str, s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| {
        ResolveError {
            node: node.to_string(),
            code: libc::EAI_NONAME,
            os_code: None,
            message: "name contains a null byte".to_string(),
        }
        .into()
    })
}

/// The endpoints returned by [resolve], consumed once in resolver order.
/// Entries of unsupported families are skipped.
pub struct AddrInfo {
    head: *mut libc::addrinfo,
    next: *mut libc::addrinfo,
}

impl Iterator for AddrInfo {
    type Item = Endpoint;

    fn next(&mut self) -> Option<Endpoint> {
        while !self.next.is_null() {
            // SAFETY: the list stays alive until `self` is dropped.
            let entry = unsafe { &*self.next };
            self.next = entry.ai_next;

            if entry.ai_addr.is_null() {
                continue;
            }
            if let Ok(ep) = unsafe { Endpoint::from_raw(entry.ai_addr, entry.ai_addrlen) } {
                return Some(ep);
            }
        }

        None
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        if !self.head.is_null() {
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

impl fmt::Debug for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrInfo")
            .field("exhausted", &self.next.is_null())
            .finish()
    }
}
