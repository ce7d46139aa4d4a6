#[macro_export]
macro_rules! some_or_return {
    ($expr:expr) => {
        if let Some(v) = $expr {
            v
        } else {
            return;
        }
    };
    ($expr:expr, $default: expr) => {
        if let Some(v) = $expr {
            v
        } else {
            return $default;
        }
    };
}

#[macro_export]
macro_rules! some_or_continue {
    ($expr:expr) => {
        if let Some(v) = $expr {
            v
        } else {
            continue;
        }
    };
}
