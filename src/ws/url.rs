use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::Result;
use crate::error::Error;

/// How the socket path is derived from the base URL.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Route {
    /// A fixed path, e.g. `/automation`
    Path(String),
    /// The base URL with `?token=...` appended
    QueryToken(SecretString),
    /// `{prefix}/{token}`, e.g. `/ws/{token}`
    PathToken { prefix: String, token: SecretString },
}

/// Build the socket URL for `route`, rewriting `http` to `ws` and `https` to `wss`.
///
/// # Errors
///
/// Returns a validation error when `base` is not a valid URL or uses a scheme other than
/// `http`, `https`, `ws` or `wss`.
pub fn websocket_url(base: &str, route: &Route) -> Result<Url> {
    let mut url = Url::parse(base)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::validation(format!(
                "unsupported scheme for websocket url: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::validation(format!("unable to set scheme {scheme} on {base}")))?;

    match route {
        Route::Path(path) => push_segments(&mut url, path.split('/'))?,
        Route::QueryToken(token) => {
            url.query_pairs_mut()
                .append_pair("token", token.expose_secret());
        }
        Route::PathToken { prefix, token } => push_segments(
            &mut url,
            prefix.split('/').chain([token.expose_secret()]),
        )?,
    }

    Ok(url)
}

fn push_segments<'a, I>(url: &mut Url, segments: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut path = url
        .path_segments_mut()
        .map_err(|()| Error::validation("websocket base url cannot carry a path"))?;
    path.pop_if_empty();
    path.extend(segments.into_iter().filter(|segment| !segment.is_empty()));
    Ok(())
}
