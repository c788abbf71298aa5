mod yrs_doc;

pub use yrs_doc::YrsFactory;
