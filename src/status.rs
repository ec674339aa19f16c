use strum::Display;

/// NT-style status codes returned by every dispatch, completion and service
/// routine.
#[repr(i32)]
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    Success = 0x0000_0000,
    Timeout = 0x0000_0102,
    Pending = 0x0000_0103,
    BufferOverflow = 0x8000_0005u32 as i32,
    Unsuccessful = 0xC000_0001u32 as i32,
    NotImplemented = 0xC000_0002u32 as i32,
    InvalidHandle = 0xC000_0008u32 as i32,
    InvalidParameter = 0xC000_000Du32 as i32,
    NoSuchDevice = 0xC000_000Eu32 as i32,
    NoSuchFile = 0xC000_000Fu32 as i32,
    InvalidDeviceRequest = 0xC000_0010u32 as i32,
    MoreProcessingRequired = 0xC000_0016u32 as i32,
    NoMemory = 0xC000_0017u32 as i32,
    BufferTooSmall = 0xC000_0023u32 as i32,
    ObjectTypeMismatch = 0xC000_0024u32 as i32,
    ObjectNameNotFound = 0xC000_0034u32 as i32,
    ObjectNameCollision = 0xC000_0035u32 as i32,
    DeletePending = 0xC000_0056u32 as i32,
    InsufficientResources = 0xC000_009Au32 as i32,
    DeviceNotReady = 0xC000_00A3u32 as i32,
    NotSupported = 0xC000_00BBu32 as i32,
    ImageAlreadyLoaded = 0xC000_010Eu32 as i32,
    Cancelled = 0xC000_0120u32 as i32,
    DriverUnableToLoad = 0xC000_026Cu32 as i32,
}

const ALL_STATUSES: [DriverStatus; 24] = [
    DriverStatus::Success,
    DriverStatus::Timeout,
    DriverStatus::Pending,
    DriverStatus::BufferOverflow,
    DriverStatus::Unsuccessful,
    DriverStatus::NotImplemented,
    DriverStatus::InvalidHandle,
    DriverStatus::InvalidParameter,
    DriverStatus::NoSuchDevice,
    DriverStatus::NoSuchFile,
    DriverStatus::InvalidDeviceRequest,
    DriverStatus::MoreProcessingRequired,
    DriverStatus::NoMemory,
    DriverStatus::BufferTooSmall,
    DriverStatus::ObjectTypeMismatch,
    DriverStatus::ObjectNameNotFound,
    DriverStatus::ObjectNameCollision,
    DriverStatus::DeletePending,
    DriverStatus::InsufficientResources,
    DriverStatus::DeviceNotReady,
    DriverStatus::NotSupported,
    DriverStatus::ImageAlreadyLoaded,
    DriverStatus::Cancelled,
    DriverStatus::DriverUnableToLoad,
];

impl DriverStatus {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        ALL_STATUSES.iter().copied().find(|s| s.code() == code)
    }

    /// `NT_SUCCESS`: informational and success severities, including
    /// `Pending`.
    #[inline]
    pub fn is_success(self) -> bool {
        self.code() >= 0
    }

    /// `NT_ERROR`: error severity only. Warnings such as `BufferOverflow`
    /// still carry data back to the caller.
    #[inline]
    pub fn is_error(self) -> bool {
        (self.code() as u32) >> 30 == 3
    }

    #[inline]
    pub fn is_pending(self) -> bool {
        self == DriverStatus::Pending
    }

    /// Bridges a status into `?`: only `Success` continues.
    #[inline]
    pub fn ok(self) -> Result<(), DriverStatus> {
        if self == DriverStatus::Success {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<DriverStatus> for i32 {
    fn from(s: DriverStatus) -> i32 {
        s.code()
    }
}

impl<T> From<Result<T, DriverStatus>> for DriverStatus {
    fn from(r: Result<T, DriverStatus>) -> Self {
        match r {
            Ok(_) => DriverStatus::Success,
            Err(e) => e,
        }
    }
}
