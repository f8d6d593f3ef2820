use std::borrow::Cow;

/// Source identifier - mostly static constants like "VISION" or "REST"
pub type ProviderId = Cow<'static, str>;
