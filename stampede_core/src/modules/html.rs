//! The `k6/html` module: CSS-selectable views over parsed HTML.

use crate::js::binding::{
  get_internal_ref, set_function_to, set_internal_ref, throw_error,
  throw_type_error,
};

use scraper::ego_tree::NodeId;
use scraper::{ElementRef, Html, Selector};
use std::rc::Rc;

pub fn exports<'s>(
  scope: &mut v8::HandleScope<'s>,
) -> v8::Local<'s, v8::Object> {
  let exports = v8::Object::new(scope);
  set_function_to(scope, exports, "parseHTML", parse_html);
  exports
}

/// The backing state of a selection object: a shared document plus the
/// selected node ids.
struct SelectionData {
  doc: Rc<Html>,
  nodes: Vec<NodeId>,
}

impl SelectionData {
  fn elements(&self) -> Vec<ElementRef<'_>> {
    self
      .nodes
      .iter()
      .filter_map(|id| self.doc.tree.get(*id))
      .filter_map(ElementRef::wrap)
      .collect()
  }
}

/// `parseHTML(src)`
fn parse_html(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if args.length() == 0 || !args.get(0).is_string() {
    throw_type_error(scope, "parseHTML() requires an html string");
    return;
  }
  let source = args.get(0).to_rust_string_lossy(scope);
  rv.set(selection_from_source(scope, &source).into());
}

/// Builds a root selection over freshly parsed HTML. Shared with
/// `response.html()`.
pub fn selection_from_source<'s>(
  scope: &mut v8::HandleScope<'s>,
  source: &str,
) -> v8::Local<'s, v8::Object> {
  let doc = Rc::new(Html::parse_document(source));
  let root = doc.root_element().id();
  new_selection(scope, SelectionData { doc, nodes: vec![root] })
}

fn new_selection<'s>(
  scope: &mut v8::HandleScope<'s>,
  data: SelectionData,
) -> v8::Local<'s, v8::Object> {
  let template = v8::ObjectTemplate::new(scope);
  template.set_internal_field_count(1);
  let object = template.new_instance(scope).unwrap();
  set_internal_ref(scope, object, 0, data);
  set_function_to(scope, object, "find", find);
  set_function_to(scope, object, "text", text);
  set_function_to(scope, object, "html", html);
  set_function_to(scope, object, "attr", attr);
  set_function_to(scope, object, "size", size);
  set_function_to(scope, object, "get", get);
  set_function_to(scope, object, "eq", eq);
  set_function_to(scope, object, "first", first);
  set_function_to(scope, object, "last", last);
  set_function_to(scope, object, "slice", slice);
  set_function_to(scope, object, "each", each);
  set_function_to(scope, object, "map", map);
  set_function_to(scope, object, "toArray", to_array);
  object
}

fn data<'s>(
  scope: &mut v8::HandleScope<'s>,
  args: &v8::FunctionCallbackArguments,
) -> &'s mut SelectionData {
  let this = args.this();
  get_internal_ref::<SelectionData>(scope, this, 0)
}

fn subselection<'s>(
  scope: &mut v8::HandleScope<'s>,
  source: &SelectionData,
  nodes: Vec<NodeId>,
) -> v8::Local<'s, v8::Object> {
  new_selection(
    scope,
    SelectionData {
      doc: source.doc.clone(),
      nodes,
    },
  )
}

/// `find(selector)`: descendants matching a CSS selector.
fn find(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let selector = args.get(0).to_rust_string_lossy(scope);
  let selector = match Selector::parse(&selector) {
    Ok(selector) => selector,
    Err(e) => {
      throw_error(scope, &format!("invalid selector {selector:?}: {e}"));
      return;
    }
  };

  let data = data(scope, &args);
  let mut nodes = vec![];
  for element in data.elements() {
    for found in element.select(&selector) {
      nodes.push(found.id());
    }
  }
  let out = subselection(scope, data, nodes);
  rv.set(out.into());
}

/// `text()`: concatenated text of the selection.
fn text(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let data = data(scope, &args);
  let mut out = String::new();
  for element in data.elements() {
    for piece in element.text() {
      out.push_str(piece);
    }
  }
  rv.set(v8::String::new(scope, &out).unwrap().into());
}

/// `html()`: outer html of the first element.
fn html(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let data = data(scope, &args);
  let out = data
    .elements()
    .first()
    .map(|e| e.html())
    .unwrap_or_default();
  rv.set(v8::String::new(scope, &out).unwrap().into());
}

/// `attr(name)`: the attribute of the first element, or undefined.
fn attr(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let name = args.get(0).to_rust_string_lossy(scope);
  let data = data(scope, &args);
  let value = data
    .elements()
    .first()
    .and_then(|e| e.value().attr(&name).map(|v| v.to_string()));
  match value {
    Some(value) => rv.set(v8::String::new(scope, &value).unwrap().into()),
    None => rv.set_undefined(),
  }
}

fn size(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let data = data(scope, &args);
  rv.set_int32(data.nodes.len() as i32);
}

/// `get(i)` / `eq(i)`: pick one element; `get` with no index behaves like
/// `toArray`.
fn eq(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let index = args.get(0).integer_value(scope).unwrap_or(0);
  let data = data(scope, &args);
  let len = data.nodes.len() as i64;
  let index = if index < 0 { len + index } else { index };
  let nodes = if index >= 0 && index < len {
    vec![data.nodes[index as usize]]
  } else {
    vec![]
  };
  let out = subselection(scope, data, nodes);
  rv.set(out.into());
}

fn get(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  rv: v8::ReturnValue,
) {
  eq(scope, args, rv);
}

fn first(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let data = data(scope, &args);
  let nodes = data.nodes.first().map(|n| vec![*n]).unwrap_or_default();
  let out = subselection(scope, data, nodes);
  rv.set(out.into());
}

fn last(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let data = data(scope, &args);
  let nodes = data.nodes.last().map(|n| vec![*n]).unwrap_or_default();
  let out = subselection(scope, data, nodes);
  rv.set(out.into());
}

/// `slice(start, end?)`
fn slice(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let data = data(scope, &args);
  let len = data.nodes.len() as i64;
  let start = args.get(0).integer_value(scope).unwrap_or(0).clamp(0, len);
  let end = if args.length() > 1 && args.get(1).is_number() {
    args.get(1).integer_value(scope).unwrap_or(len).clamp(start, len)
  } else {
    len
  };
  let nodes = data.nodes[start as usize..end as usize].to_vec();
  let out = subselection(scope, data, nodes);
  rv.set(out.into());
}

/// `each(fn(idx, sel))`
fn each(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  if !args.get(0).is_function() {
    throw_type_error(scope, "each() requires a function");
    return;
  }
  let callback = v8::Local::<v8::Function>::try_from(args.get(0)).unwrap();
  let nodes = data(scope, &args).nodes.clone();
  let this = args.this();

  for (i, node) in nodes.iter().enumerate() {
    let single = {
      let data = get_internal_ref::<SelectionData>(scope, this, 0);
      subselection(scope, data, vec![*node])
    };
    let undefined = v8::undefined(scope).into();
    let index = v8::Integer::new(scope, i as i32);
    if callback
      .call(scope, undefined, &[index.into(), single.into()])
      .is_none()
    {
      return;
    }
  }
}

/// `map(fn(idx, sel))`
fn map(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if !args.get(0).is_function() {
    throw_type_error(scope, "map() requires a function");
    return;
  }
  let callback = v8::Local::<v8::Function>::try_from(args.get(0)).unwrap();
  let nodes = data(scope, &args).nodes.clone();
  let this = args.this();

  let out = v8::Array::new(scope, nodes.len() as i32);
  for (i, node) in nodes.iter().enumerate() {
    let single = {
      let data = get_internal_ref::<SelectionData>(scope, this, 0);
      subselection(scope, data, vec![*node])
    };
    let undefined = v8::undefined(scope).into();
    let index = v8::Integer::new(scope, i as i32);
    match callback.call(scope, undefined, &[index.into(), single.into()]) {
      Some(value) => {
        out.set_index(scope, i as u32, value);
      }
      None => return,
    }
  }
  rv.set(out.into());
}

/// `toArray()`: one single-element selection per node.
fn to_array(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let nodes = data(scope, &args).nodes.clone();
  let this = args.this();
  let out = v8::Array::new(scope, nodes.len() as i32);
  for (i, node) in nodes.iter().enumerate() {
    let single = {
      let data = get_internal_ref::<SelectionData>(scope, this, 0);
      subselection(scope, data, vec![*node])
    };
    out.set_index(scope, i as u32, single.into());
  }
  rv.set(out.into());
}
