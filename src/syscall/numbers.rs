// System call numbers. Keep in sync with the user library's stubs.

pub const SYS_CPUTS: u64 = 0;
pub const SYS_CGETC: u64 = 1;
pub const SYS_GETENVID: u64 = 2;
pub const SYS_ENV_DESTROY: u64 = 3;
pub const SYS_YIELD: u64 = 4;
pub const SYS_EXOFORK: u64 = 5;
pub const SYS_ENV_SET_STATUS: u64 = 6;
pub const SYS_PAGE_ALLOC: u64 = 7;
pub const SYS_PAGE_MAP: u64 = 8;
pub const SYS_PAGE_UNMAP: u64 = 9;
pub const SYS_ENV_SET_PGFAULT_UPCALL: u64 = 10;
pub const SYS_IPC_TRY_SEND: u64 = 11;
pub const SYS_IPC_RECV: u64 = 12;
