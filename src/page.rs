use minijinja::{context, Environment, Value};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

const TEMPLATE_NAME: &str = "index.html";
const TEMPLATE: &str = include_str!("../templates/index.html");

/// Everything except the RFC 3986 unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Per-request values shown on the page. Both are absent on a plain GET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub caption: Option<String>,
    pub image_url: Option<String>,
}

impl PageContext {
    pub fn captioned(filename: &str, caption: String) -> Self {
        Self {
            caption: Some(caption),
            image_url: Some(upload_url(filename)),
        }
    }
}

/// URL under which an uploaded file is served back.
pub fn upload_url(filename: &str) -> String {
    format!("/uploads/{}", utf8_percent_encode(filename, PATH_SEGMENT))
}

pub struct PageRenderer {
    env: Environment<'static>,
}

impl PageRenderer {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, page: &PageContext) -> Result<String, minijinja::Error> {
        // The URL is percent-encoded already; HTML-escaping it again would mangle the slashes.
        let image_url = page.image_url.clone().map(Value::from_safe_string);
        self.env
            .get_template(TEMPLATE_NAME)?
            .render(context! { caption => page.caption.as_deref(), image_url })
    }
}
