//! GSS-style backend for macOS (GSS.framework).
//!
//! `connect` acquires a Kerberos initiator credential and holds it until
//! `close`. Each ticket request acquires its own credential, imports the
//! target as a host-based service name (`service@host`) and initializes a
//! context, first under SPNEGO and then directly under Kerberos V5 (see
//! [`negotiate`](super::negotiate::negotiate)). Every native object is owned
//! by a guard that releases it on drop, so cleanup happens on every path.

use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr;

use super::negotiate::{self, AttemptOutcome, Mechanism};
use super::{ServiceTicket, TicketError, TicketTransport};
use crate::spn::ServicePrincipal;

#[allow(non_camel_case_types)]
mod ffi {
    use std::ffi::c_void;

    pub type OM_uint32 = u32;
    pub type gss_name_t = *mut c_void;
    pub type gss_cred_id_t = *mut c_void;
    pub type gss_ctx_id_t = *mut c_void;

    // GSS.framework packs its public structs to 2 bytes.
    #[repr(C, packed(2))]
    pub struct gss_OID_desc {
        pub length: OM_uint32,
        pub elements: *mut c_void,
    }
    pub type gss_OID = *mut gss_OID_desc;

    #[repr(C, packed(2))]
    pub struct gss_OID_set_desc {
        pub count: usize,
        pub elements: gss_OID,
    }
    pub type gss_OID_set = *mut gss_OID_set_desc;

    #[repr(C, packed(2))]
    pub struct gss_buffer_desc {
        pub length: usize,
        pub value: *mut c_void,
    }
    pub type gss_buffer_t = *mut gss_buffer_desc;

    pub const GSS_S_COMPLETE: OM_uint32 = 0;
    pub const GSS_S_CONTINUE_NEEDED: OM_uint32 = 1;
    pub const GSS_C_INDEFINITE: OM_uint32 = 0xffff_ffff;
    pub const GSS_C_INITIATE: i32 = 1;
    pub const GSS_C_MUTUAL_FLAG: OM_uint32 = 2;
    pub const GSS_C_GSS_CODE: i32 = 1;
    pub const GSS_C_MECH_CODE: i32 = 2;

    #[link(name = "GSS", kind = "framework")]
    unsafe extern "C" {
        pub fn gss_acquire_cred(
            minor_status: *mut OM_uint32,
            desired_name: gss_name_t,
            time_req: OM_uint32,
            desired_mechs: gss_OID_set,
            cred_usage: i32,
            output_cred_handle: *mut gss_cred_id_t,
            actual_mechs: *mut gss_OID_set,
            time_rec: *mut OM_uint32,
        ) -> OM_uint32;

        pub fn gss_inquire_cred(
            minor_status: *mut OM_uint32,
            cred_handle: gss_cred_id_t,
            name: *mut gss_name_t,
            lifetime: *mut OM_uint32,
            cred_usage: *mut i32,
            mechanisms: *mut gss_OID_set,
        ) -> OM_uint32;

        pub fn gss_release_cred(
            minor_status: *mut OM_uint32,
            cred_handle: *mut gss_cred_id_t,
        ) -> OM_uint32;

        pub fn gss_import_name(
            minor_status: *mut OM_uint32,
            input_name_buffer: gss_buffer_t,
            input_name_type: gss_OID,
            output_name: *mut gss_name_t,
        ) -> OM_uint32;

        pub fn gss_display_name(
            minor_status: *mut OM_uint32,
            input_name: gss_name_t,
            output_name_buffer: gss_buffer_t,
            output_name_type: *mut gss_OID,
        ) -> OM_uint32;

        pub fn gss_release_name(minor_status: *mut OM_uint32, name: *mut gss_name_t) -> OM_uint32;

        pub fn gss_init_sec_context(
            minor_status: *mut OM_uint32,
            initiator_cred_handle: gss_cred_id_t,
            context_handle: *mut gss_ctx_id_t,
            target_name: gss_name_t,
            mech_type: gss_OID,
            req_flags: OM_uint32,
            time_req: OM_uint32,
            input_chan_bindings: *mut c_void,
            input_token: gss_buffer_t,
            actual_mech_type: *mut gss_OID,
            output_token: gss_buffer_t,
            ret_flags: *mut OM_uint32,
            time_rec: *mut OM_uint32,
        ) -> OM_uint32;

        pub fn gss_delete_sec_context(
            minor_status: *mut OM_uint32,
            context_handle: *mut gss_ctx_id_t,
            output_token: gss_buffer_t,
        ) -> OM_uint32;

        pub fn gss_release_buffer(minor_status: *mut OM_uint32, buffer: gss_buffer_t) -> OM_uint32;

        pub fn gss_display_status(
            minor_status: *mut OM_uint32,
            status_value: OM_uint32,
            status_type: i32,
            mech_type: gss_OID,
            message_context: *mut OM_uint32,
            status_string: gss_buffer_t,
        ) -> OM_uint32;
    }
}

use ffi::*;

/// 1.2.840.113554.1.2.1.4
const NT_HOSTBASED_SERVICE: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x01, 0x04];

/// Darwin 20 is macOS 11, the first release whose GSS.framework talks to
/// the GSSCred service.
pub fn framework_supported() -> bool {
    let mut uts = std::mem::MaybeUninit::<libc::utsname>::zeroed();
    // SAFETY: uname fills the struct it is given and reports failure via -1.
    if unsafe { libc::uname(uts.as_mut_ptr()) } != 0 {
        return false;
    }
    // SAFETY: uname returned 0, so the struct is initialized.
    let uts = unsafe { uts.assume_init() };
    // SAFETY: release is NUL-terminated by uname.
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    darwin_major(&release.to_string_lossy()).is_some_and(|major| major >= 20)
}

fn darwin_major(release: &str) -> Option<u32> {
    release.split('.').next()?.parse().ok()
}

fn oid_desc(der: &'static [u8]) -> gss_OID_desc {
    gss_OID_desc {
        length: der.len() as OM_uint32,
        elements: der.as_ptr() as *mut c_void,
    }
}

fn empty_buffer() -> gss_buffer_desc {
    gss_buffer_desc {
        length: 0,
        value: ptr::null_mut(),
    }
}

fn failed(major: OM_uint32) -> bool {
    major != GSS_S_COMPLETE && major != GSS_S_CONTINUE_NEEDED
}

/// Human readable text for a major/minor status pair.
fn status_message(major: OM_uint32, minor: OM_uint32) -> String {
    let mut parts = display_status(major, GSS_C_GSS_CODE);
    if minor != 0 {
        parts.extend(display_status(minor, GSS_C_MECH_CODE));
    }
    if parts.is_empty() {
        format!("major {:#x}, minor {:#x}", major, minor)
    } else {
        format!("{} (major {:#x}, minor {:#x})", parts.join(": "), major, minor)
    }
}

fn display_status(code: OM_uint32, kind: i32) -> Vec<String> {
    let mut messages = Vec::new();
    let mut context: OM_uint32 = 0;
    loop {
        let mut minor = 0;
        let mut text = Buffer(empty_buffer());
        // SAFETY: all out-pointers are valid; the buffer guard releases the text.
        let major = unsafe {
            gss_display_status(
                &mut minor,
                code,
                kind,
                ptr::null_mut(),
                &mut context,
                &mut text.0,
            )
        };
        if major != GSS_S_COMPLETE {
            break;
        }
        let message = String::from_utf8_lossy(text.as_bytes()).into_owned();
        if !message.is_empty() {
            messages.push(message);
        }
        if context == 0 || messages.len() > 8 {
            break;
        }
    }
    messages
}

/// Owned `gss_buffer_desc` filled by the library.
struct Buffer(gss_buffer_desc);

impl Buffer {
    fn as_bytes(&self) -> &[u8] {
        let length = self.0.length;
        let value = self.0.value;
        if value.is_null() || length == 0 {
            return &[];
        }
        // SAFETY: the library owns `length` readable bytes at `value` until release.
        unsafe { std::slice::from_raw_parts(value as *const u8, length) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let value = self.0.value;
        if !value.is_null() {
            let mut minor = 0;
            // SAFETY: the buffer was produced by GSS and is released once.
            unsafe { gss_release_buffer(&mut minor, &mut self.0) };
        }
    }
}

/// Owned credential handle.
#[derive(Debug)]
struct Credential(gss_cred_id_t);

// SAFETY: a credential handle is only touched through &mut by its owner.
unsafe impl Send for Credential {}

impl Credential {
    /// Acquire the default initiator credential, restricted to Kerberos V5.
    fn acquire() -> Result<Self, (OM_uint32, OM_uint32)> {
        let mut krb5 = oid_desc(Mechanism::Krb5.oid_der());
        let mut mechs = gss_OID_set_desc {
            count: 1,
            elements: &mut krb5,
        };
        let mut handle: gss_cred_id_t = ptr::null_mut();
        let mut minor = 0;
        // SAFETY: the OID set outlives the call; out-pointers are valid.
        let major = unsafe {
            gss_acquire_cred(
                &mut minor,
                ptr::null_mut(),
                GSS_C_INDEFINITE,
                &mut mechs,
                GSS_C_INITIATE,
                &mut handle,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if major != GSS_S_COMPLETE {
            return Err((major, minor));
        }
        Ok(Self(handle))
    }

    /// The principal the credential belongs to, and its remaining lifetime.
    fn inquire(&self) -> Result<(String, u32), (OM_uint32, OM_uint32)> {
        let mut name = Name(ptr::null_mut());
        let mut lifetime = 0;
        let mut minor = 0;
        // SAFETY: the handle is live; the name guard releases the output.
        let major = unsafe {
            gss_inquire_cred(
                &mut minor,
                self.0,
                &mut name.0,
                &mut lifetime,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if major != GSS_S_COMPLETE {
            return Err((major, minor));
        }
        Ok((name.display()?, lifetime))
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        if !self.0.is_null() {
            let mut minor = 0;
            // SAFETY: the handle was produced by gss_acquire_cred.
            unsafe { gss_release_cred(&mut minor, &mut self.0) };
        }
    }
}

/// Owned imported name.
struct Name(gss_name_t);

impl Name {
    fn import_host_based(service: &str) -> Result<Self, (OM_uint32, OM_uint32)> {
        let mut input = gss_buffer_desc {
            length: service.len(),
            value: service.as_ptr() as *mut c_void,
        };
        let mut name_type = oid_desc(NT_HOSTBASED_SERVICE);
        let mut name: gss_name_t = ptr::null_mut();
        let mut minor = 0;
        // SAFETY: input and name_type outlive the call; GSS copies the name.
        let major =
            unsafe { gss_import_name(&mut minor, &mut input, &mut name_type, &mut name) };
        if major != GSS_S_COMPLETE {
            return Err((major, minor));
        }
        Ok(Self(name))
    }

    fn display(&self) -> Result<String, (OM_uint32, OM_uint32)> {
        let mut text = Buffer(empty_buffer());
        let mut minor = 0;
        // SAFETY: the name is live; the buffer guard releases the output.
        let major =
            unsafe { gss_display_name(&mut minor, self.0, &mut text.0, ptr::null_mut()) };
        if major != GSS_S_COMPLETE {
            return Err((major, minor));
        }
        Ok(String::from_utf8_lossy(text.as_bytes()).into_owned())
    }
}

impl Drop for Name {
    fn drop(&mut self) {
        if !self.0.is_null() {
            let mut minor = 0;
            // SAFETY: the name was produced by GSS.
            unsafe { gss_release_name(&mut minor, &mut self.0) };
        }
    }
}

/// Owned security context. Dropping it deletes the context.
struct Context(gss_ctx_id_t);

impl Drop for Context {
    fn drop(&mut self) {
        if !self.0.is_null() {
            let mut minor = 0;
            // SAFETY: the context was produced by gss_init_sec_context.
            unsafe { gss_delete_sec_context(&mut minor, &mut self.0, ptr::null_mut()) };
        }
    }
}

/// One `gss_init_sec_context` call under `mechanism`.
///
/// The context guard is dropped before returning, whatever the outcome.
fn init_context(cred: &Credential, target: &Name, mechanism: Mechanism) -> AttemptOutcome {
    let mut mech = oid_desc(mechanism.oid_der());
    let mut context = Context(ptr::null_mut());
    let mut output = Buffer(empty_buffer());
    let mut ret_flags = 0;
    let mut minor = 0;

    // SAFETY: handles are live for the duration; guards release outputs.
    let major = unsafe {
        gss_init_sec_context(
            &mut minor,
            cred.0,
            &mut context.0,
            target.0,
            &mut mech,
            GSS_C_MUTUAL_FLAG,
            GSS_C_INDEFINITE,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            &mut output.0,
            &mut ret_flags,
            ptr::null_mut(),
        )
    };

    if failed(major) {
        return AttemptOutcome::Failed(status_message(major, minor));
    }
    let token = output.as_bytes().to_vec();
    if major == GSS_S_COMPLETE {
        AttemptOutcome::Complete(token)
    } else {
        AttemptOutcome::ContinueNeeded(token)
    }
}

/// Ticket transport over GSS.framework.
#[derive(Debug, Default)]
pub struct GssTransport {
    debug: bool,
    credential: Option<Credential>,
}

impl GssTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TicketTransport for GssTransport {
    fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    fn set_ccache_path(&mut self, _path: Option<PathBuf>) {
        // The system credential service chooses the cache.
    }

    fn connect(&mut self) -> Result<(), TicketError> {
        let credential = Credential::acquire().map_err(|(major, minor)| TicketError::Connection {
            message: format!("no usable Kerberos credential: {}", status_message(major, minor)),
        })?;
        if self.debug {
            if let Ok((principal, lifetime)) = credential.inquire() {
                tracing::debug!(%principal, lifetime, "GSS credential acquired");
            }
        }
        self.credential = Some(credential);
        Ok(())
    }

    fn close(&mut self) {
        self.credential = None;
    }

    fn get_service_ticket(&mut self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        if self.credential.is_none() {
            return Err(TicketError::NotConnected);
        }

        let initiator = Credential::acquire().map_err(|(major, minor)| TicketError::Acquisition {
            message: status_message(major, minor),
        })?;

        let host_based = spn.host_based();
        if self.debug && host_based != spn.as_str() {
            tracing::debug!(spn = %spn, name = %host_based, "converted to host-based form");
        }
        let target = Name::import_host_based(&host_based).map_err(|(major, minor)| {
            TicketError::NameImport {
                spn: spn.to_string(),
                message: status_message(major, minor),
            }
        })?;
        if self.debug {
            if let Ok(canonical) = target.display() {
                tracing::debug!(target = %canonical, "target name imported");
            }
        }

        let negotiated =
            negotiate::negotiate(self.debug, |mechanism| init_context(&initiator, &target, mechanism))?;
        Ok(ServiceTicket::new(negotiated.token))
    }

    fn default_principal(&self) -> Result<String, TicketError> {
        let credential = self.credential.as_ref().ok_or(TicketError::NotConnected)?;
        credential
            .inquire()
            .map(|(principal, _)| principal)
            .map_err(|(major, minor)| TicketError::Acquisition {
                message: status_message(major, minor),
            })
    }

    fn cache_location(&self) -> String {
        "GSS".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_darwin_major_parsing() {
        assert_eq!(darwin_major("20.6.0"), Some(20));
        assert_eq!(darwin_major("19.6.0"), Some(19));
        assert_eq!(darwin_major("garbage"), None);
    }

    #[test]
    fn test_close_without_connect() {
        let mut transport = GssTransport::new();
        transport.close();
        transport.close();
        let spn = ServicePrincipal::parse("HTTP/svc.example.com").unwrap();
        assert!(matches!(
            transport.get_service_ticket(&spn),
            Err(TicketError::NotConnected)
        ));
    }
}
