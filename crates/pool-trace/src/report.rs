use std::{error::Error, fmt};

use pool_alloc::Location;
use snafu::Snafu;

use crate::logger::{Color, Colored};

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub(crate) struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

impl GenericError {
    pub(crate) fn location(&self) -> Location {
        self.location
    }
}

/// Formats an error followed by its chain of causes.
pub(crate) struct Report<'a> {
    error: &'a GenericError,
}

impl<'a> Report<'a> {
    pub(crate) fn new(error: &'a GenericError) -> Self {
        Self { error }
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", Colored(Color::Red, self.error))?;
        writeln!(f, "  at {}", Colored(Color::DarkGray, self.error.location()))?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {}", Colored(Color::Red, s))?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}
