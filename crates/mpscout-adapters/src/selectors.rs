//! CSS selectors for the marketplace search and detail views.

pub const CANDIDATE_LINK: &str = r#"a[href*="/marketplace/item/"]"#;
pub const SHIPPING_MARKER: &str = r#"i[data-visualcompletion="css-img"]"#;
pub const CARD_IMAGE: &str = "img";
pub const CARD_TITLE: &str = r#"span[style*="-webkit-line-clamp"]"#;

pub const BODY: &str = "body";
pub const DIALOG: &str = r#"div[role="dialog"]"#;
pub const DIALOG_CLOSE: &str = r#"div[role="dialog"] div[aria-label="Close"][role="button"]"#;
pub const PAGE_CLOSE: &str = r#"div[aria-label="Close"][role="button"]"#;
pub const PERSISTENT_OVERLAY: &str = "div.__fb-light-mode";
pub const LOGIN_PROMPT_FORM: &str = "form#login_popup_cta_form";

pub const POST_TIME: &str = "abbr[aria-label]";
pub const POST_TIME_ATTR: &str = "aria-label";
pub const PRICE_SPAN: &str = r#"div[aria-hidden="false"] span"#;
pub const LOCATION_LINK: &str = r#"a[href*="/marketplace/"]"#;
pub const LOCATION_LABEL: &str = "span";
pub const PRODUCT_PHOTO: &str = r#"img[alt^="Product photo of"]"#;
