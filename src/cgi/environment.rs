//! CGI meta-variables

use cgi::router::Script;
use server::Request;

use std::collections::BTreeMap;

/// A script's environment. Keys are unique; a later insert replaces an
/// earlier one.
pub type Environment = BTreeMap<String, String>;

/// How the server describes itself to scripts
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub software: String,
    pub name: String,
    pub port: u16,
    pub protocol: String
}

/// Methods whose request body gets passed on to the script
pub fn is_write_method(method: &str) -> bool {
    match method {
        "POST" | "PUT" | "PATCH" => true,
        _ => false
    }
}

/// The meta-variable a request header is exposed as, like `HTTP_X_TEST` for
/// `X-Test`.
pub fn header_variable(name: &str) -> String {
    let mut variable = String::with_capacity(name.len() + 5);
    variable.push_str("HTTP_");
    variable.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }
    }));

    variable
}

/// Builds the meta-variables for running `script` on behalf of `req`.
pub fn build(req: &Request, script: &Script, query: &str,
             server: &ServerIdentity) -> Environment
{
    let mut env = Environment::new();

    env.insert(String::from("SERVER_SOFTWARE"), server.software.clone());
    env.insert(String::from("SERVER_NAME"), server.name.clone());
    env.insert(String::from("GATEWAY_INTERFACE"), String::from("CGI/1.1"));
    env.insert(String::from("SERVER_PROTOCOL"), server.protocol.clone());
    env.insert(String::from("SERVER_PORT"), server.port.to_string());
    env.insert(String::from("REQUEST_METHOD"), String::from(req.method()));
    env.insert(String::from("SCRIPT_NAME"), script.name.clone());
    env.insert(String::from("PATH_INFO"), script.path_info.clone());
    env.insert(String::from("PATH_TRANSLATED"),
               script.file.to_string_lossy().into_owned());
    env.insert(String::from("QUERY_STRING"), String::from(query));
    env.insert(String::from("REMOTE_ADDR"), req.remote_addr.ip().to_string());

    if is_write_method(req.method()) {
        let header = |name: &str| req.headers().get(name)
            .map(|v| String::from_utf8_lossy(v).into_owned());

        env.insert(String::from("CONTENT_TYPE"),
                   header("Content-Type").unwrap_or_else(String::new));
        env.insert(String::from("CONTENT_LENGTH"),
                   header("Content-Length").unwrap_or_else(|| String::from("0")));
    }

    for &(ref name, ref value) in req.headers() {
        let variable = header_variable(name);
        if variable == "HTTP_CONTENT_TYPE" || variable == "HTTP_CONTENT_LENGTH" {
            continue;
        }

        env.insert(variable, String::from_utf8_lossy(value).into_owned());
    }

    env
}
