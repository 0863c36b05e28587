//! Contains [`FunctionBuilder`], which assembles a [`Function`](crate::base::Function) tree from
//! flat inlinee and line records.

use std::borrow::Cow;

use symbolic_common::Name;

use crate::base::{FileInfo, Function, LineInfo};

/// Allows creating a [`Function`] from unordered line and inlinee records.
///
/// Debug formats commonly describe inlining as a flat list of address ranges tagged with a
/// nesting depth, and line records only for the innermost frame at each address. The builder
/// turns this into the tree that [`Function`] models:
///
///  - every inlinee becomes a child of the closest enclosing inlinee with a lower depth,
///  - every line record is copied to each level of the inline stack, where the parent levels
///    receive the call site of their child instead of the leaf location,
///  - all lines and inlinees end up sorted by address.
pub struct FunctionBuilder<'s> {
    name: Name<'s>,
    compilation_dir: Cow<'s, [u8]>,
    address: u64,
    size: u64,
    inlinees: Vec<PendingInlinee<'s>>,
    lines: Vec<LineInfo<'s>>,
}

impl<'s> FunctionBuilder<'s> {
    /// Creates a new builder for a given outer function.
    pub fn new<D>(name: Name<'s>, compilation_dir: D, address: u64, size: u64) -> Self
    where
        D: Into<Cow<'s, [u8]>>,
    {
        Self {
            name,
            compilation_dir: compilation_dir.into(),
            address,
            size,
            inlinees: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Adds an inlinee record. This method can be called in any order.
    ///
    /// Calls made directly from the outer function have depth 0, calls made from such an
    /// inlinee have depth 1, and so on.
    pub fn add_inlinee(
        &mut self,
        depth: u32,
        name: Name<'s>,
        address: u64,
        size: u64,
        call_file: FileInfo<'s>,
        call_line: u64,
    ) {
        self.inlinees.push(PendingInlinee {
            depth,
            address,
            size,
            name,
            call_file,
            call_line,
        });
    }

    /// Adds a line record for the innermost function covering `address`.
    ///
    /// This method can be called in any order.
    pub fn add_leaf_line(
        &mut self,
        address: u64,
        size: Option<u64>,
        file: FileInfo<'s>,
        line: u64,
    ) {
        self.lines.push(LineInfo {
            address,
            size,
            file,
            line,
        });
    }

    /// Creates the `Function`, consuming the builder.
    pub fn finish(self) -> Function<'s> {
        let FunctionBuilder {
            name,
            compilation_dir,
            address,
            size,
            mut inlinees,
            mut lines,
        } = self;

        // DFS order: parents sort before their children at the same address.
        inlinees.sort_by_key(|inlinee| (inlinee.address, inlinee.depth));
        lines.sort_by_key(|line| line.address);

        let mut stack = InlineStack::new(Function {
            address,
            size,
            name,
            compilation_dir: compilation_dir.clone(),
            lines: Vec::new(),
            inlinees: Vec::new(),
            inline: false,
        });

        let mut inlinees = inlinees.into_iter().peekable();
        let mut lines = lines.into_iter().peekable();

        loop {
            // An inlinee starting at the same address as a line is opened first, since the line
            // is located inside of it.
            let inlinee_first = match (inlinees.peek(), lines.peek()) {
                (Some(inlinee), Some(line)) => inlinee.address <= line.address,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            if inlinee_first {
                if let Some(inlinee) = inlinees.next() {
                    stack.flush_address(inlinee.address);
                    stack.flush_depth(inlinee.depth);
                    stack.push(inlinee, &compilation_dir);
                }
            } else if let Some(line) = lines.next() {
                stack.flush_address(line.address);
                stack.push_line(line);
            }
        }

        stack.finish()
    }
}

/// An inlined call that has not been placed into the tree yet.
struct PendingInlinee<'s> {
    depth: u32,
    address: u64,
    size: u64,
    name: Name<'s>,
    call_file: FileInfo<'s>,
    call_line: u64,
}

/// An inlinee on the open part of the stack, together with the location it was called from.
struct OpenInlinee<'s> {
    end_address: u64,
    function: Function<'s>,
    call_file: FileInfo<'s>,
    call_line: u64,
}

/// The chain of functions covering the address currently being processed.
struct InlineStack<'s> {
    outer: Function<'s>,
    open: Vec<OpenInlinee<'s>>,
}

impl<'s> InlineStack<'s> {
    fn new(outer: Function<'s>) -> Self {
        Self {
            outer,
            open: Vec::new(),
        }
    }

    /// Closes the innermost open inlinee and attaches it to its caller.
    fn pop(&mut self) {
        let Some(closed) = self.open.pop() else {
            return;
        };

        match self.open.last_mut() {
            Some(parent) => parent.function.inlinees.push(closed.function),
            None => self.outer.inlinees.push(closed.function),
        }
    }

    /// Closes all inlinees that end at or before `address`.
    fn flush_address(&mut self, address: u64) {
        while self
            .open
            .last()
            .map_or(false, |inlinee| inlinee.end_address <= address)
        {
            self.pop();
        }
    }

    /// Closes all inlinees at nesting level `depth` or deeper.
    fn flush_depth(&mut self, depth: u32) {
        while self.open.len() > depth as usize {
            self.pop();
        }
    }

    fn push(&mut self, inlinee: PendingInlinee<'s>, compilation_dir: &Cow<'s, [u8]>) {
        self.open.push(OpenInlinee {
            end_address: inlinee.address.saturating_add(inlinee.size),
            function: Function {
                address: inlinee.address,
                size: inlinee.size,
                name: inlinee.name,
                compilation_dir: compilation_dir.clone(),
                lines: Vec::new(),
                inlinees: Vec::new(),
                inline: true,
            },
            call_file: inlinee.call_file,
            call_line: inlinee.call_line,
        });
    }

    /// Records a leaf line at every level of the stack.
    ///
    /// The innermost function receives the line as is. Every caller receives the same address
    /// range, attributed to the call site of the function directly nested in it.
    fn push_line(&mut self, mut line: LineInfo<'s>) {
        for inlinee in self.open.iter_mut().rev() {
            inlinee.function.lines.push(line.clone());
            line.file = inlinee.call_file.clone();
            line.line = inlinee.call_line;
        }
        self.outer.lines.push(line);
    }

    fn finish(mut self) -> Function<'s> {
        while !self.open.is_empty() {
            self.pop();
        }
        self.outer
    }
}
