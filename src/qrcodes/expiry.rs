use time::OffsetDateTime;

use crate::store::QrCode;

/// Whether the code is expired at `now`: the manual flag wins, otherwise the
/// code expires once `now` is strictly past `expires_at`. No `expires_at`
/// means it never expires on time alone.
pub fn is_expired_at(qr: &QrCode, now: OffsetDateTime) -> bool {
    if qr.is_manually_expired {
        return true;
    }
    qr.expires_at.is_some_and(|at| now > at)
}

pub fn is_expired(qr: &QrCode) -> bool {
    is_expired_at(qr, OffsetDateTime::now_utc())
}
