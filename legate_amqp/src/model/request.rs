use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The payload of a request envelope: the dispatch target plus its arguments.
///
/// A target is either a bare function (no `classname`) or a method on a
/// registered class instance (`classname` + `method`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// The registered class name, when targeting a method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classname: Option<String>,

    /// The function or method name.
    pub method: String,

    /// Positional arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,

    /// Keyword arguments.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kws: Map<String, Value>,
}

impl Request {
    /// Creates a request targeting a bare registered function.
    pub fn function(method: impl Into<String>) -> Self {
        Self {
            classname: None,
            method: method.into(),
            args: Vec::new(),
            kws: Map::new(),
        }
    }

    /// Creates a request targeting a method on a registered class.
    pub fn method(classname: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            classname: Some(classname.into()),
            method: method.into(),
            args: Vec::new(),
            kws: Map::new(),
        }
    }

    /// Sets the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Sets the keyword arguments.
    pub fn with_kws(mut self, kws: Map<String, Value>) -> Self {
        self.kws = kws;
        self
    }

    /// Renders the dispatch target for logging (`Class.method` or `method`).
    pub fn target(&self) -> String {
        match &self.classname {
            Some(classname) => format!("{}.{}", classname, self.method),
            None => self.method.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn function_target() {
        let request = Request::function("echo");

        assert_eq!(request.target(), "echo");
        assert_eq!(request.classname, None);
    }

    #[test]
    fn method_target() {
        let request = Request::method("Admin", "hello");

        assert_eq!(request.target(), "Admin.hello");
    }

    #[test]
    fn empty_arguments_are_not_serialized() {
        let request = Request::function("noop");

        let text = serde_json::to_string(&request).unwrap();

        assert_eq!(text, r#"{"method":"noop"}"#);
    }

    #[test]
    fn arguments_round_trip() {
        let mut kws = Map::new();
        kws.insert("retries".to_string(), json!(3));
        let request = Request::function("install")
            .with_args(vec![json!("pkg")])
            .with_kws(kws);

        let text = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&text).unwrap();

        assert_eq!(decoded, request);
    }
}
