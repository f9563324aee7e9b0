// vim: tw=80
//! The Result Recorder
//!
//! Judges each scenario exactly once, and persists the verdict along with its
//! diagnostics as `<dir>/<scenario>.result`.  The first line of the artifact
//! is `pass (<code>)` or `fail (<code>)`, where `<code>` is the last response
//! code that the storage service returned.  The rest is a YAML [`Report`].

use serde_derive::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    fs,
    io,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::{
    gateway::{Request, Response},
    types::{Error, Result},
    verifier::VerificationOutcome,
};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => "pass".fmt(f),
            Verdict::Fail => "fail".fmt(f),
        }
    }
}

/// One administrative round trip
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResponseEntry {
    pub request:     String,
    pub code:        i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// The raw reply
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload:     String,
}

/// Why a scenario stopped before it could finish
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Abort {
    /// See [`Error::class`]
    pub class:   String,
    pub message: String,
}

impl From<&Error> for Abort {
    fn from(e: &Error) -> Self {
        Abort {
            class:   e.class().to_owned(),
            message: e.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Diagnostics {
    pub responses: Vec<ResponseEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted:   Option<Abort>,
}

impl Diagnostics {
    /// The most recent response code, or 0 if the service never answered.
    pub fn last_code(&self) -> i32 {
        self.responses.last().map(|r| r.code).unwrap_or(0)
    }

    pub fn push(&mut self, req: &Request, resp: &Response) {
        self.responses.push(ResponseEntry {
            request:     req.label().to_owned(),
            code:        resp.code,
            description: resp.description.clone(),
            payload:     resp.payload.clone(),
        });
    }
}

/// The body of a result artifact
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Report {
    pub scenario:    String,
    pub verdict:     Verdict,
    pub outcomes:    Vec<VerificationOutcome>,
    pub diagnostics: Diagnostics,
}

#[derive(Clone, Debug)]
pub struct ResultRecorder {
    dir: PathBuf,
}

impl ResultRecorder {
    /// A scenario passes iff it ran to completion and every region it
    /// verified was consistent.
    pub fn judge(outcomes: &[VerificationOutcome], diagnostics: &Diagnostics)
        -> Verdict
    {
        if diagnostics.aborted.is_none() &&
            outcomes.iter().all(VerificationOutcome::is_consistent)
        {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        ResultRecorder { dir: dir.as_ref().to_owned() }
    }

    /// Where the artifact for `scenario` lives
    pub fn path(&self, scenario: &str) -> PathBuf {
        self.dir.join(format!("{scenario}.result"))
    }

    /// Read back a previously recorded artifact
    pub fn read(&self, scenario: &str) -> Result<Report> {
        let contents = fs::read_to_string(self.path(scenario))?;
        let body = contents.split_once('\n')
            .map(|(_, body)| body)
            .unwrap_or_default();
        serde_yaml_ng::from_str(body)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData,
                                                  e)))
    }

    /// Judge `scenario` and persist the result, replacing any earlier result
    /// for the same scenario.
    pub fn record(
        &self,
        scenario: &str,
        outcomes: Vec<VerificationOutcome>,
        diagnostics: Diagnostics
    ) -> Result<Verdict>
    {
        let verdict = Self::judge(&outcomes, &diagnostics);
        let code = diagnostics.last_code();
        let report = Report {
            scenario: scenario.to_owned(),
            verdict,
            outcomes,
            diagnostics
        };
        let body = serde_yaml_ng::to_string(&report)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData,
                                                  e)))?;
        fs::create_dir_all(&self.dir)?;
        let path = self.path(scenario);
        fs::write(&path, format!("{verdict} ({code})\n{body}"))?;
        info!(scenario, %verdict, path = %path.display(), "result recorded");
        Ok(verdict)
    }
}
