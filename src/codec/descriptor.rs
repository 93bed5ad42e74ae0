//! Class descriptor conversion
//!
//! `Landroid/os/Debug;` becomes `android.os.Debug`, `[I` becomes `int[]`.
//! Strings that are not descriptors pass through unchanged.

/// Convert a VM type descriptor to dotted source notation
pub fn descriptor_to_dot(descriptor: &str) -> String {
    let dims = descriptor.bytes().take_while(|&b| b == b'[').count();
    let element = &descriptor[dims..];

    let base = if let Some(body) = element
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
    {
        body.replace('/', ".")
    } else if dims > 0 {
        match primitive_name(element) {
            Some(name) => name.to_string(),
            None => element.to_string(),
        }
    } else {
        element.to_string()
    };

    let mut out = String::with_capacity(base.len() + dims * 2);
    out.push_str(&base);
    for _ in 0..dims {
        out.push_str("[]");
    }
    out
}

/// Inverse of [`descriptor_to_dot`] for names that name a class or array
pub fn dot_to_descriptor(name: &str) -> String {
    let mut dims = 0;
    let mut base = name;
    while let Some(stripped) = base.strip_suffix("[]") {
        dims += 1;
        base = stripped;
    }

    let mut out = "[".repeat(dims);
    match primitive_code(base) {
        Some(code) if dims > 0 => out.push(code),
        _ => {
            out.push('L');
            out.push_str(&base.replace('.', "/"));
            out.push(';');
        }
    }
    out
}

fn primitive_name(code: &str) -> Option<&'static str> {
    match code {
        "C" => Some("char"),
        "B" => Some("byte"),
        "Z" => Some("boolean"),
        "S" => Some("short"),
        "I" => Some("int"),
        "J" => Some("long"),
        "F" => Some("float"),
        "D" => Some("double"),
        _ => None,
    }
}

fn primitive_code(name: &str) -> Option<char> {
    match name {
        "char" => Some('C'),
        "byte" => Some('B'),
        "boolean" => Some('Z'),
        "short" => Some('S'),
        "int" => Some('I'),
        "long" => Some('J'),
        "float" => Some('F'),
        "double" => Some('D'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_descriptor() {
        assert_eq!(descriptor_to_dot("Landroid/os/Debug;"), "android.os.Debug");
    }

    #[test]
    fn test_primitive_arrays() {
        assert_eq!(descriptor_to_dot("[I"), "int[]");
        assert_eq!(descriptor_to_dot("[[J"), "long[][]");
        assert_eq!(descriptor_to_dot("[Z"), "boolean[]");
    }

    #[test]
    fn test_object_arrays() {
        assert_eq!(
            descriptor_to_dot("[[Ljava/lang/String;"),
            "java.lang.String[][]"
        );
    }

    #[test]
    fn test_non_descriptor_passthrough() {
        assert_eq!(descriptor_to_dot("onCreate"), "onCreate");
        assert_eq!(descriptor_to_dot("MainActivity.java"), "MainActivity.java");
        // A bare primitive code is only a type inside an array
        assert_eq!(descriptor_to_dot("I"), "I");
    }

    #[test]
    fn test_dot_to_descriptor_inverts() {
        for descriptor in ["Landroid/os/Debug;", "[I", "[[Ljava/lang/String;", "[D"] {
            assert_eq!(dot_to_descriptor(&descriptor_to_dot(descriptor)), descriptor);
        }
    }
}
