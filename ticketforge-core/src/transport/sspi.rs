//! Native security-provider backend for Windows (SSPI, "Negotiate" package).
//!
//! `connect` acquires an outbound credential handle for the signed-in
//! session. Each ticket request creates one client security context for the
//! target, captures the first-leg token and deletes the context. The
//! Negotiate package picks the mechanism itself, so no local fallback runs.

use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr;

use windows_sys::Win32::Security::Authentication::Identity::{
    AcquireCredentialsHandleW, DeleteSecurityContext, FreeContextBuffer, FreeCredentialsHandle,
    InitializeSecurityContextW, SecBuffer, SecBufferDesc,
};
use windows_sys::Win32::Security::Credentials::SecHandle;

use super::{ServiceTicket, TicketError, TicketTransport};
use crate::spn::ServicePrincipal;

const SEC_E_OK: i32 = 0;
const SEC_I_CONTINUE_NEEDED: i32 = 0x0009_0312;
const SEC_I_COMPLETE_NEEDED: i32 = 0x0009_0313;
const SEC_I_COMPLETE_AND_CONTINUE: i32 = 0x0009_0314;

const SECPKG_CRED_OUTBOUND: u32 = 2;
const SECURITY_NATIVE_DREP: u32 = 0x10;
const SECBUFFER_VERSION: u32 = 0;
const SECBUFFER_TOKEN: u32 = 2;
const ISC_REQ_MUTUAL_AUTH: u32 = 0x2;
const ISC_REQ_ALLOCATE_MEMORY: u32 = 0x100;

const PACKAGE: &str = "Negotiate";

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn empty_handle() -> SecHandle {
    SecHandle {
        dwLower: 0,
        dwUpper: 0,
    }
}

/// Owned outbound credential handle.
struct Credential(SecHandle);

// SAFETY: the handle is an opaque token owned by this value alone.
unsafe impl Send for Credential {}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

impl Credential {
    fn acquire_current_user() -> Result<Self, i32> {
        let package = wide(PACKAGE);
        let mut handle = empty_handle();
        let mut expiry: i64 = 0;
        // SAFETY: the package name outlives the call; out-pointers are valid.
        let status = unsafe {
            AcquireCredentialsHandleW(
                ptr::null(),
                package.as_ptr(),
                SECPKG_CRED_OUTBOUND,
                ptr::null(),
                ptr::null(),
                None,
                ptr::null(),
                &mut handle,
                &mut expiry,
            )
        };
        if status != SEC_E_OK {
            return Err(status);
        }
        Ok(Self(handle))
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        // SAFETY: the handle came from AcquireCredentialsHandleW and is freed once.
        unsafe { FreeCredentialsHandle(&self.0) };
    }
}

/// A client context; deleted on drop once it has been created.
struct Context {
    handle: SecHandle,
    created: bool,
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.created {
            // SAFETY: the handle was filled by InitializeSecurityContextW.
            unsafe { DeleteSecurityContext(&self.handle) };
        }
    }
}

/// Buffer allocated by the package under `ISC_REQ_ALLOCATE_MEMORY`.
struct ContextBuffer(*mut c_void);

impl Drop for ContextBuffer {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: the buffer was allocated by SSPI.
            unsafe { FreeContextBuffer(self.0) };
        }
    }
}

fn status_text(status: i32) -> String {
    format!("SSPI status {:#010x}", status as u32)
}

/// Ticket transport over SSPI.
#[derive(Debug, Default)]
pub struct SspiTransport {
    debug: bool,
    credential: Option<Credential>,
}

impl SspiTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TicketTransport for SspiTransport {
    fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    fn set_ccache_path(&mut self, _path: Option<PathBuf>) {
        // The LSA owns the credential cache.
    }

    fn connect(&mut self) -> Result<(), TicketError> {
        let credential =
            Credential::acquire_current_user().map_err(|status| TicketError::Connection {
                message: format!("cannot acquire current user credentials: {}", status_text(status)),
            })?;
        if self.debug {
            tracing::debug!(package = PACKAGE, "SSPI credentials acquired");
        }
        self.credential = Some(credential);
        Ok(())
    }

    fn close(&mut self) {
        self.credential = None;
    }

    fn get_service_ticket(&mut self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        let credential = self.credential.as_ref().ok_or(TicketError::NotConnected)?;
        let target = wide(&spn.target_name());
        if self.debug {
            tracing::debug!(spn = %spn, "initializing SSPI context");
        }

        let mut context = Context {
            handle: empty_handle(),
            created: false,
        };
        let mut out_buffer = SecBuffer {
            cbBuffer: 0,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: ptr::null_mut(),
        };
        let mut out_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut out_buffer,
        };
        let mut attributes: u32 = 0;
        let mut expiry: i64 = 0;

        // SAFETY: every pointer refers to a local that outlives the call.
        let status = unsafe {
            InitializeSecurityContextW(
                &credential.0,
                ptr::null(),
                target.as_ptr(),
                ISC_REQ_MUTUAL_AUTH | ISC_REQ_ALLOCATE_MEMORY,
                0,
                SECURITY_NATIVE_DREP,
                ptr::null(),
                0,
                &mut context.handle,
                &mut out_desc,
                &mut attributes,
                &mut expiry,
            )
        };
        let token = ContextBuffer(out_buffer.pvBuffer);

        match status {
            SEC_E_OK
            | SEC_I_CONTINUE_NEEDED
            | SEC_I_COMPLETE_NEEDED
            | SEC_I_COMPLETE_AND_CONTINUE => context.created = true,
            _ => {
                return Err(TicketError::Negotiation {
                    message: format!("InitializeSecurityContext failed: {}", status_text(status)),
                });
            }
        }

        let len = out_buffer.cbBuffer as usize;
        if token.0.is_null() || len == 0 {
            return Err(TicketError::EmptyToken);
        }
        // SAFETY: SSPI allocated `len` bytes at the token pointer.
        let bytes = unsafe { std::slice::from_raw_parts(token.0 as *const u8, len) }.to_vec();

        if self.debug {
            tracing::debug!(len = bytes.len(), "SSPI token captured");
        }
        Ok(ServiceTicket::new(bytes))
    }

    fn default_principal(&self) -> Result<String, TicketError> {
        Err(TicketError::Acquisition {
            message: "the principal name is not exposed through SSPI credentials".to_string(),
        })
    }

    fn cache_location(&self) -> String {
        "SSPI".to_string()
    }
}
