/// Reads the identity embedded in a dash binary: the `ProductName` version
/// resource and the issuer of its Authenticode signer.
///
/// On non-Windows platforms both queries compile and return `None`.
use std::path::Path;

pub trait BinaryInspector: Send + Sync {
    /// `ProductName` from the version resource. `None` when the file has no
    /// version resource; `Some("")` when the field is present but empty.
    fn product_name(&self, path: &Path) -> Option<String>;

    /// Issuer distinguished name of the certificate that signed the file,
    /// formatted `CN=..., OU=..., O=..., C=..`.
    fn signer_issuer(&self, path: &Path) -> Option<String>;
}

/// [`BinaryInspector`] reading real PE resources and signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeInspector;

impl BinaryInspector for PeInspector {
    fn product_name(&self, path: &Path) -> Option<String> {
        #[cfg(windows)]
        {
            imp::product_name(path)
        }
        #[cfg(not(windows))]
        {
            let _ = path;
            None
        }
    }

    fn signer_issuer(&self, path: &Path) -> Option<String> {
        #[cfg(windows)]
        {
            imp::signer_issuer(path)
        }
        #[cfg(not(windows))]
        {
            let _ = path;
            None
        }
    }
}

// ── Windows implementation ─────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use windows::core::PCWSTR;
    use windows::Win32::Security::Cryptography::{
        CertCloseStore, CertNameToStrW, CryptMsgClose, CryptMsgGetParam, CryptQueryObject,
        CERT_NAME_STR_REVERSE_FLAG, CERT_QUERY_CONTENT_FLAG_PKCS7_SIGNED_EMBED,
        CERT_QUERY_ENCODING_TYPE, CERT_QUERY_FORMAT_FLAG_BINARY, CERT_QUERY_OBJECT_FILE,
        CERT_STRING_TYPE, CERT_X500_NAME_STR, CMSG_SIGNER_INFO, CMSG_SIGNER_INFO_PARAM,
        HCERTSTORE, X509_ASN_ENCODING,
    };
    use windows::Win32::Storage::FileSystem::{
        GetFileVersionInfoSizeW, GetFileVersionInfoW, VerQueryValueW,
    };

    fn to_wide(s: impl AsRef<std::ffi::OsStr>) -> Vec<u16> {
        s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Returns the UTF-16 string at `sub_block` inside a version-info block.
    fn query_string(block: &[u8], sub_block: &str) -> Option<String> {
        let key = to_wide(sub_block);
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let mut len = 0u32;
        let ok = unsafe {
            VerQueryValueW(
                block.as_ptr() as *const c_void,
                PCWSTR::from_raw(key.as_ptr()),
                &mut ptr,
                &mut len,
            )
        };
        if !ok.as_bool() || ptr.is_null() {
            return None;
        }
        let chars = unsafe { std::slice::from_raw_parts(ptr as *const u16, len as usize) };
        let text = String::from_utf16_lossy(chars);
        Some(text.trim_end_matches('\0').to_string())
    }

    pub fn product_name(path: &Path) -> Option<String> {
        let wide = to_wide(path);
        let size = unsafe { GetFileVersionInfoSizeW(PCWSTR::from_raw(wide.as_ptr()), None) };
        if size == 0 {
            return None;
        }
        let mut block = vec![0u8; size as usize];
        unsafe {
            GetFileVersionInfoW(
                PCWSTR::from_raw(wide.as_ptr()),
                0,
                size,
                block.as_mut_ptr() as *mut c_void,
            )
        }
        .ok()?;

        // First language/codepage pair from the translation table.
        let key = to_wide(r"\VarFileInfo\Translation");
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let mut len = 0u32;
        let ok = unsafe {
            VerQueryValueW(
                block.as_ptr() as *const c_void,
                PCWSTR::from_raw(key.as_ptr()),
                &mut ptr,
                &mut len,
            )
        };
        let (lang, codepage) = if ok.as_bool() && !ptr.is_null() && len >= 4 {
            let pair = unsafe { std::slice::from_raw_parts(ptr as *const u16, 2) };
            (pair[0], pair[1])
        } else {
            // US English, Unicode.
            (0x0409, 0x04b0)
        };

        let sub_block = format!(r"\StringFileInfo\{lang:04x}{codepage:04x}\ProductName");
        Some(query_string(&block, &sub_block).unwrap_or_default())
    }

    pub fn signer_issuer(path: &Path) -> Option<String> {
        let wide = to_wide(path);
        let mut store = HCERTSTORE::default();
        let mut msg: *mut c_void = std::ptr::null_mut();
        unsafe {
            CryptQueryObject(
                CERT_QUERY_OBJECT_FILE,
                wide.as_ptr() as *const c_void,
                CERT_QUERY_CONTENT_FLAG_PKCS7_SIGNED_EMBED,
                CERT_QUERY_FORMAT_FLAG_BINARY,
                0,
                None,
                None,
                None,
                Some(&mut store),
                Some(&mut msg),
                None,
            )
        }
        .ok()?;

        let issuer = signer_issuer_from_msg(msg);

        unsafe {
            let _ = CryptMsgClose(Some(msg as *const c_void));
            let _ = CertCloseStore(store, 0);
        }
        issuer
    }

    fn signer_issuer_from_msg(msg: *mut c_void) -> Option<String> {
        let mut size = 0u32;
        unsafe { CryptMsgGetParam(msg, CMSG_SIGNER_INFO_PARAM, 0, None, &mut size) }.ok()?;
        let mut buf = vec![0u8; size as usize];
        unsafe {
            CryptMsgGetParam(
                msg,
                CMSG_SIGNER_INFO_PARAM,
                0,
                Some(buf.as_mut_ptr() as *mut c_void),
                &mut size,
            )
        }
        .ok()?;
        let info = unsafe { &*(buf.as_ptr() as *const CMSG_SIGNER_INFO) };

        let encoding = CERT_QUERY_ENCODING_TYPE(X509_ASN_ENCODING.0);
        let str_type = CERT_STRING_TYPE(CERT_X500_NAME_STR.0 | CERT_NAME_STR_REVERSE_FLAG);
        let needed = unsafe { CertNameToStrW(encoding, &info.Issuer, str_type, None) };
        if needed <= 1 {
            return None;
        }
        let mut name = vec![0u16; needed as usize];
        unsafe { CertNameToStrW(encoding, &info.Issuer, str_type, Some(&mut name)) };
        Some(String::from_utf16_lossy(&name).trim_end_matches('\0').to_string())
    }
}
