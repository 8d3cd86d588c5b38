//! Result and origin codes carried in the TCI result fields
//!
//! Values follow the GlobalPlatform TEE Client API, plus the vendor codes the
//! secure world uses to report blocked, locked and killed services.

pub const TEEC_SUCCESS: u32 = 0x0000_0000;
pub const TEEC_ERROR_GENERIC: u32 = 0xFFFF_0000;
pub const TEEC_ERROR_ACCESS_DENIED: u32 = 0xFFFF_0001;
pub const TEEC_ERROR_CANCEL: u32 = 0xFFFF_0002;
pub const TEEC_ERROR_ACCESS_CONFLICT: u32 = 0xFFFF_0003;
pub const TEEC_ERROR_EXCESS_DATA: u32 = 0xFFFF_0004;
pub const TEEC_ERROR_BAD_FORMAT: u32 = 0xFFFF_0005;
pub const TEEC_ERROR_BAD_PARAMETERS: u32 = 0xFFFF_0006;
pub const TEEC_ERROR_BAD_STATE: u32 = 0xFFFF_0007;
pub const TEEC_ERROR_ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
pub const TEEC_ERROR_NOT_IMPLEMENTED: u32 = 0xFFFF_0009;
pub const TEEC_ERROR_NOT_SUPPORTED: u32 = 0xFFFF_000A;
pub const TEEC_ERROR_NO_DATA: u32 = 0xFFFF_000B;
pub const TEEC_ERROR_OUT_OF_MEMORY: u32 = 0xFFFF_000C;
pub const TEEC_ERROR_BUSY: u32 = 0xFFFF_000D;
pub const TEEC_ERROR_COMMUNICATION: u32 = 0xFFFF_000E;
pub const TEEC_ERROR_SECURITY: u32 = 0xFFFF_000F;
pub const TEEC_ERROR_SHORT_BUFFER: u32 = 0xFFFF_0010;
pub const TEEC_ERROR_TARGET_DEAD: u32 = 0xFFFF_3024;

// Vendor extensions
pub const TEEC_ERROR_TA_LOCKED: u32 = 0xFFFF_0257;
pub const TEEC_ERROR_SD_BLOCKED: u32 = 0xFFFF_0258;
pub const TEEC_ERROR_TARGET_KILLED: u32 = 0xFFFF_0259;

/// Result produced by the client API itself
pub const TEEC_ORIGIN_API: u32 = 1;
/// Result produced by the communication stack (driver, transport)
pub const TEEC_ORIGIN_COMMS: u32 = 2;
/// Result produced by the secure-world OS
pub const TEEC_ORIGIN_TEE: u32 = 3;
/// Result produced by the trusted application
pub const TEEC_ORIGIN_TRUSTED_APP: u32 = 4;

// Login methods
pub const TEEC_LOGIN_PUBLIC: u32 = 0x0;
pub const TEEC_LOGIN_USER: u32 = 0x1;
pub const TEEC_LOGIN_GROUP: u32 = 0x2;
pub const TEEC_LOGIN_APPLICATION: u32 = 0x4;
pub const TEEC_LOGIN_USER_APPLICATION: u32 = 0x5;
pub const TEEC_LOGIN_GROUP_APPLICATION: u32 = 0x6;
