//! Named-pipe listener with an SDDL-derived security descriptor.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr::null_mut;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};
use tracing::debug;

use crate::config::PipePermissions;

pub type PipeStream = NamedPipeServer;

/// Serial named-pipe acceptor. One pipe instance is kept pending at all
/// times; `accept` hands out the connected instance and immediately creates
/// the next one so no client ever sees ERROR_FILE_NOT_FOUND between
/// connections.
pub struct PipeListener {
  path: String,
  security_descriptor: String,
  pending: Option<NamedPipeServer>,
}

impl PipeListener {
  pub fn bind(path: &str, permissions: PipePermissions) -> io::Result<Self> {
    let security_descriptor = resolve_descriptor(permissions)?;
    let first = create_instance(path, &security_descriptor, true)?;
    debug!(path, "named pipe listener created");
    Ok(Self { path: path.to_string(), security_descriptor, pending: Some(first) })
  }

  pub async fn accept(&mut self) -> io::Result<NamedPipeServer> {
    let server = match self.pending.take() {
      Some(server) => server,
      None => create_instance(&self.path, &self.security_descriptor, false)?,
    };
    server.connect().await?;
    self.pending = Some(create_instance(&self.path, &self.security_descriptor, false)?);
    Ok(server)
  }
}

/// Dial an existing pipe; used by the startup preflight that refuses to run
/// when another listener already owns the pipe.
pub async fn dial(path: &str) -> io::Result<NamedPipeClient> {
  ClientOptions::new().open(path)
}

/// Substitute `$SID` with the current user's SID and keep the SDDL string.
fn resolve_descriptor(permissions: PipePermissions) -> io::Result<String> {
  let descriptor = permissions.descriptor();
  if descriptor.contains("$SID") {
    let sid = current_user_sid()?;
    Ok(descriptor.replace("$SID", &sid))
  } else {
    Ok(descriptor.to_string())
  }
}

fn create_instance(path: &str, sddl: &str, first: bool) -> io::Result<NamedPipeServer> {
  use winapi::shared::minwindef::ULONG;
  use winapi::shared::sddl::ConvertStringSecurityDescriptorToSecurityDescriptorW;
  use winapi::um::winbase::LocalFree;
  use winapi::um::winnt::SECURITY_DESCRIPTOR;

  let sddl_wide: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();
  let mut descriptor: *mut SECURITY_DESCRIPTOR = null_mut();

  let converted = unsafe {
    ConvertStringSecurityDescriptorToSecurityDescriptorW(
      sddl_wide.as_ptr(),
      1, // SDDL_REVISION_1
      &mut descriptor as *mut _ as *mut *mut c_void,
      null_mut::<ULONG>(),
    )
  };
  if converted == 0 {
    return Err(io::Error::last_os_error());
  }

  let mut attributes = winapi::um::minwinbase::SECURITY_ATTRIBUTES {
    nLength: mem::size_of::<winapi::um::minwinbase::SECURITY_ATTRIBUTES>() as u32,
    lpSecurityDescriptor: descriptor as *mut c_void,
    bInheritHandle: 0,
  };

  let mut options = ServerOptions::new();
  options.first_pipe_instance(first);
  let result =
    unsafe { options.create_with_security_attributes_raw(path, &mut attributes as *mut _ as *mut c_void) };

  unsafe {
    LocalFree(descriptor as *mut c_void);
  }
  result
}

/// SID of the user this process runs as, in string form.
fn current_user_sid() -> io::Result<String> {
  use winapi::um::handleapi::CloseHandle;
  use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
  use winapi::shared::sddl::ConvertSidToStringSidW;
  use winapi::um::securitybaseapi::GetTokenInformation;
  use winapi::um::winbase::LocalFree;
  use winapi::um::winnt::{TOKEN_QUERY, TOKEN_USER, TokenUser};

  unsafe {
    let mut token = null_mut();
    if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
      return Err(io::Error::last_os_error());
    }

    let mut needed = 0u32;
    GetTokenInformation(token, TokenUser, null_mut(), 0, &mut needed);
    let mut buffer = vec![0u8; needed as usize];
    if GetTokenInformation(token, TokenUser, buffer.as_mut_ptr() as *mut c_void, needed, &mut needed) == 0 {
      let err = io::Error::last_os_error();
      CloseHandle(token);
      return Err(err);
    }
    CloseHandle(token);

    let token_user = &*(buffer.as_ptr() as *const TOKEN_USER);
    let mut sid_string: *mut u16 = null_mut();
    if ConvertSidToStringSidW(token_user.User.Sid, &mut sid_string) == 0 {
      return Err(io::Error::last_os_error());
    }

    let mut len = 0usize;
    while *sid_string.add(len) != 0 {
      len += 1;
    }
    let sid = String::from_utf16_lossy(std::slice::from_raw_parts(sid_string, len));
    LocalFree(sid_string as *mut c_void);
    Ok(sid)
  }
}
