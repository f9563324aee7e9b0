// vim: tw=80
mod spor;

use util::*;
